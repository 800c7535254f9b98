//! Configuration values the core reads, with the defaults named in the
//! design documents. Each binary composes these sub-structs into its own
//! top-level `GaiaConfig` (see `gaia-orchestrator`, `gaia-cognition`,
//! `gaia-promotectl`) loaded from TOML with environment-variable
//! overrides.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    pub idle_threshold_secs: u64,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self { idle_threshold_secs: 5 * 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistractionConfig {
    pub threshold_pct: f32,
    pub window_samples: usize,
}

impl Default for DistractionConfig {
    fn default() -> Self {
        Self { threshold_pct: 25.0, window_samples: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_secs: u64,
    pub fail_threshold: u32,
    pub recover_threshold: u32,
    pub probe_connect_timeout_secs: u64,
    pub probe_request_timeout_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            fail_threshold: 2,
            recover_threshold: 3,
            probe_connect_timeout_secs: 3,
            probe_request_timeout_secs: 5,
        }
    }
}

/// Sub-deadlines within one handoff attempt. These exact numbers are not
/// load-bearing on their own — exposing them as configuration matters
/// more than the defaults — but they are a reasonable starting point
/// (see DESIGN.md for the rationale).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    pub outer_deadline_secs: u64,
    pub drain_deadline_secs: u64,
    pub release_deadline_secs: u64,
    pub start_deadline_secs: u64,
    pub verify_deadline_secs: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            outer_deadline_secs: 180,
            drain_deadline_secs: 10,
            release_deadline_secs: 30,
            start_deadline_secs: 60,
            verify_deadline_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    pub health_poll_max_secs: u64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self { health_poll_max_secs: 180 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub history_max_entries: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { history_max_entries: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSyncConfig {
    pub interval_secs: u64,
}

impl Default for StateSyncConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}
