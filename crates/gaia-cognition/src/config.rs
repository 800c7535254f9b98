//! `GaiaConfig` for the cognition-service binary: the service's own
//! identity, checkpoint root, canned response text, and the shared
//! sub-configs from `gaia_proto::config`.

use gaia_proto::config::{DistractionConfig, SleepConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GaiaConfig {
    pub bind_addr: String,
    pub service_name: String,
    pub primary_worker: String,
    pub canned_response: String,
    pub checkpoint_root: PathBuf,
    pub checkpoint_history_max_entries: usize,
    pub sleep: SleepConfig,
    pub distraction: DistractionConfig,
    pub resource_poll_secs: u64,
}

impl Default for GaiaConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8081".to_string(),
            service_name: "cognition-a".to_string(),
            primary_worker: "prime".to_string(),
            canned_response: "zzz... gaia is resting, your message has been queued".to_string(),
            checkpoint_root: PathBuf::from("/var/lib/gaia/checkpoints"),
            checkpoint_history_max_entries: 1000,
            sleep: SleepConfig::default(),
            distraction: DistractionConfig::default(),
            resource_poll_secs: 5,
        }
    }
}

impl GaiaConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        toml::from_str(&data).map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))
    }

    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = GaiaConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaia-cognition.toml");
        config.save(&path).unwrap();
        let loaded = GaiaConfig::load(&path).unwrap();
        assert_eq!(loaded.service_name, config.service_name);
        assert_eq!(loaded.sleep.idle_threshold_secs, config.sleep.idle_threshold_secs);
    }
}
