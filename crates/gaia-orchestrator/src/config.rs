//! `GaiaConfig` for the orchestrator binary: the device's known workers,
//! the roles the HA watchdog protects, and the shared sub-configs from
//! `gaia_proto::config`.

use gaia_proto::config::{HandoffConfig, StateSyncConfig, WatchdogConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub name: String,
    /// "prime" or "study" — validated against `gaia_proto::model::WorkerKind` at load time.
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleEntry {
    pub role: String,
    pub primary: String,
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GaiaConfig {
    pub bind_addr: String,
    pub device_workers: Vec<WorkerEntry>,
    pub initial_owner: Option<String>,
    pub roles: Vec<RoleEntry>,
    pub maintenance_flag_path: Option<PathBuf>,
    pub state_sync_live_root: Option<PathBuf>,
    pub state_sync_candidate_root: Option<PathBuf>,
    pub state_sync_allowlist: Vec<PathBuf>,
    /// Base URL of the cognition service to notify of GPU handoff
    /// completions (`/sleep/study-handoff`). `None` leaves the
    /// coordinator without a notifier, e.g. for a device with no
    /// cognition service deployed yet.
    pub cognition_endpoint: Option<String>,
    pub handoff: HandoffConfig,
    pub watchdog: WatchdogConfig,
    pub state_sync: StateSyncConfig,
}

impl Default for GaiaConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            device_workers: vec![
                WorkerEntry { name: "prime".to_string(), kind: "prime".to_string() },
                WorkerEntry { name: "study".to_string(), kind: "study".to_string() },
            ],
            initial_owner: Some("prime".to_string()),
            roles: vec![RoleEntry {
                role: "core".to_string(),
                primary: "http://127.0.0.1:8080".to_string(),
                fallback: None,
            }],
            maintenance_flag_path: None,
            state_sync_live_root: None,
            state_sync_candidate_root: None,
            state_sync_allowlist: Vec::new(),
            cognition_endpoint: None,
            handoff: HandoffConfig::default(),
            watchdog: WatchdogConfig::default(),
            state_sync: StateSyncConfig::default(),
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
