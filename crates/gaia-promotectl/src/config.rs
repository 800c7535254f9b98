//! `PlanConfig`: the on-disk description of one promotion run — the
//! services to promote, the worker/owner topology the GPU handoff
//! coordinator needs, and the operator knobs that become
//! `gaia_promote::PipelineOptions`.

use gaia_proto::config::HandoffConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub live_source: PathBuf,
    pub candidate_source: PathBuf,
    pub backup_root: PathBuf,
    pub worker: String,
    pub candidate_endpoint: String,
    pub live_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    pub services: Vec<ServiceEntry>,
    pub known_workers: Vec<String>,
    pub initial_owner: Option<String>,
    pub desired_gpu_owner: String,
    pub keep_live: bool,
    pub skip_validation: bool,
    pub skip_smoke: bool,
    pub skip_adapter_validation: bool,
    pub adapter_training_worker: Option<String>,
    pub gpu_deadline_secs: u64,
    pub shutdown_grace_secs: u64,
    pub health_poll_max_secs: u64,
    pub commit_journal: bool,
    pub handoff: HandoffConfig,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            services: vec![ServiceEntry {
                name: "cognition".to_string(),
                live_source: PathBuf::from("/srv/gaia/cognition/live"),
                candidate_source: PathBuf::from("/srv/gaia/cognition/candidate"),
                backup_root: PathBuf::from("/srv/gaia/cognition/backups"),
                worker: "prime".to_string(),
                candidate_endpoint: "http://127.0.0.1:8091/health".to_string(),
                live_endpoint: "http://127.0.0.1:8081/health".to_string(),
            }],
            known_workers: vec!["prime".to_string(), "study".to_string()],
            initial_owner: Some("prime".to_string()),
            desired_gpu_owner: "prime".to_string(),
            keep_live: false,
            skip_validation: false,
            skip_smoke: false,
            skip_adapter_validation: true,
            adapter_training_worker: None,
            gpu_deadline_secs: 180,
            shutdown_grace_secs: 30,
            health_poll_max_secs: 180,
            commit_journal: true,
            handoff: HandoffConfig::default(),
        }
    }
}

impl PlanConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading plan {}: {e}", path.display()))?;
        toml::from_str(&data).map_err(|e| anyhow::anyhow!("parsing plan {}: {e}", path.display()))
    }

    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}
