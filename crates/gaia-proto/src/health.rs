//! `HealthProbe`: the external collaborator that issues liveness checks
//! against named endpoints (C3). `HealthSnapshot` is the shared result
//! type consumed by both `GPUHandoffCoordinator` (verifying a newly
//! started worker) and `HealthWatchdog` (routing decisions).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HealthOutcome {
    Http(u16),
    Error(String),
}

/// Result of one liveness check against one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub target: String,
    pub ok: bool,
    pub latency_ms: u64,
    pub observed_at: DateTime<Utc>,
    pub outcome: HealthOutcome,
}

impl HealthSnapshot {
    /// 2xx/3xx are successes; 5xx and timeouts/connection errors are
    /// failures; other 4xx count as successes (the endpoint is
    /// reachable) — per the watchdog's failure semantics.
    pub fn from_http_status(target: impl Into<String>, status: u16, latency_ms: u64) -> Self {
        let ok = status < 500;
        Self {
            target: target.into(),
            ok,
            latency_ms,
            observed_at: Utc::now(),
            outcome: HealthOutcome::Http(status),
        }
    }

    pub fn from_error(target: impl Into<String>, error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            target: target.into(),
            ok: false,
            latency_ms,
            observed_at: Utc::now(),
            outcome: HealthOutcome::Error(error.into()),
        }
    }
}

/// Issues a liveness check against a named endpoint, bounded by the
/// caller-supplied timeout. Implementations dial real HTTP endpoints in
/// production; this crate only provides a scripted double for tests.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, target: &str, timeout: Duration) -> HealthSnapshot;
}

/// A double whose responses for each target are pre-scripted by the
/// caller — pops one `HealthSnapshot` per call, repeating the last
/// scripted value once its queue is exhausted. Used by `gaia-handoff`
/// and `gaia-ha`'s own test suites as well as `gaia-tests`' scenarios.
#[derive(Default)]
pub struct ScriptedHealthProbe {
    scripts: Mutex<HashMap<String, Vec<HealthOutcome>>>,
}

impl ScriptedHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, target: &str, outcomes: Vec<HealthOutcome>) {
        self.scripts.lock().insert(target.to_string(), outcomes);
    }

    pub fn always_healthy(&self, target: &str) {
        self.script(target, vec![HealthOutcome::Http(200)]);
    }

    pub fn always_failing(&self, target: &str, status: u16) {
        self.script(target, vec![HealthOutcome::Http(status)]);
    }
}

#[async_trait]
impl HealthProbe for ScriptedHealthProbe {
    async fn check(&self, target: &str, _timeout: Duration) -> HealthSnapshot {
        let mut scripts = self.scripts.lock();
        let outcome = match scripts.get_mut(target) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) => queue[0].clone(),
            None => HealthOutcome::Error("no script configured".to_string()),
        };
        match outcome {
            HealthOutcome::Http(status) => HealthSnapshot::from_http_status(target, status, 1),
            HealthOutcome::Error(msg) => HealthSnapshot::from_error(target, msg, 1),
        }
    }
}

/// Production `HealthProbe`: a GET against `target`, with a short connect
/// timeout layered under the caller's overall request timeout so a
/// half-open connection doesn't eat the whole watchdog tick. One client
/// is built once and shared across every call rather than per-request.
pub struct ReqwestHealthProbe {
    client: reqwest::Client,
}

impl ReqwestHealthProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .expect("failed to build HTTP client"),
        }
    }
}

impl Default for ReqwestHealthProbe {
    /// Three-second connect timeout, matching `WatchdogConfig`'s default.
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl HealthProbe for ReqwestHealthProbe {
    async fn check(&self, target: &str, timeout: Duration) -> HealthSnapshot {
        let started = Instant::now();
        let result = self.client.get(target).timeout(timeout).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(response) => HealthSnapshot::from_http_status(target, response.status().as_u16(), latency_ms),
            Err(e) => HealthSnapshot::from_error(target, e.to_string(), latency_ms),
        }
    }
}
