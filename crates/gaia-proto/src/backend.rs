//! `ContainerBackend`: the external collaborator that starts, stops and
//! inspects the processes that own a GPU device (C1). The core treats any
//! implementation as a black box; only an in-memory test double ships
//! here, for use by the rest of the workspace's test suites.

use crate::model::Worker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRunState {
    Running,
    Stopped,
    Crashed,
    Starting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub state: WorkerRunState,
    pub restarts: u32,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("worker {0} not recognized by this backend")]
    UnknownWorker(String),

    #[error("start failed for {0}: {1}")]
    StartFailed(String, String),

    #[error("stop failed for {0}: {1}")]
    StopFailed(String, String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Minimum operations the orchestration core requires of a process
/// supervisor. `start` must be idempotent when the worker is already
/// running; `stop` signals graceful shutdown and escalates after
/// `grace`.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    async fn start(&self, worker: &Worker) -> BackendResult<()>;
    async fn stop(&self, worker: &Worker, grace: Duration) -> BackendResult<()>;
    async fn status(&self, worker: &Worker) -> BackendResult<WorkerStatus>;
    fn healthcheck_endpoint(&self, worker: &Worker) -> String;
}

/// Deterministic in-memory double used by the workspace's own test
/// suites and by `gaia-tests`' end-to-end scenarios. Not wired into any
/// binary — a real process supervisor is out of scope for this core.
#[derive(Default)]
pub struct InMemoryContainerBackend {
    state: Mutex<HashMap<String, WorkerStatus>>,
    /// Workers listed here fail their next `start` call exactly once,
    /// then behave normally — used to simulate transient start failures.
    fail_next_start: Mutex<HashMap<String, bool>>,
}

impl InMemoryContainerBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Test hook: force the next `start(worker)` call for `name` to fail.
    pub fn fail_next_start(&self, name: &str) {
        self.fail_next_start.lock().insert(name.to_string(), true);
    }

    pub fn set_running(&self, name: &str) {
        self.state.lock().insert(
            name.to_string(),
            WorkerStatus {
                state: WorkerRunState::Running,
                restarts: 0,
                started_at: Some(Utc::now()),
            },
        );
    }
}

#[async_trait]
impl ContainerBackend for InMemoryContainerBackend {
    async fn start(&self, worker: &Worker) -> BackendResult<()> {
        if let Some(flag) = self.fail_next_start.lock().get_mut(&worker.name) {
            if *flag {
                *flag = false;
                return Err(BackendError::StartFailed(
                    worker.name.clone(),
                    "simulated start failure".to_string(),
                ));
            }
        }
        let mut state = self.state.lock();
        let entry = state
            .entry(worker.name.clone())
            .or_insert_with(|| WorkerStatus {
                state: WorkerRunState::Stopped,
                restarts: 0,
                started_at: None,
            });
        if entry.state == WorkerRunState::Running {
            return Ok(()); // idempotent
        }
        entry.state = WorkerRunState::Running;
        entry.started_at = Some(Utc::now());
        entry.restarts += 1;
        Ok(())
    }

    async fn stop(&self, worker: &Worker, _grace: Duration) -> BackendResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .entry(worker.name.clone())
            .or_insert_with(|| WorkerStatus {
                state: WorkerRunState::Stopped,
                restarts: 0,
                started_at: None,
            });
        entry.state = WorkerRunState::Stopped;
        Ok(())
    }

    async fn status(&self, worker: &Worker) -> BackendResult<WorkerStatus> {
        let state = self.state.lock();
        state
            .get(&worker.name)
            .cloned()
            .ok_or_else(|| BackendError::UnknownWorker(worker.name.clone()))
    }

    fn healthcheck_endpoint(&self, worker: &Worker) -> String {
        format!("http://127.0.0.1:0/{}/health", worker.name)
    }
}
