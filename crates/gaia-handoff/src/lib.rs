//! GPUHandoffCoordinator (C8): safely transfers exclusive ownership of one
//! device between exactly two workers, without ever leaving the device
//! half-owned or orphaned, within a bounded deadline.
//!
//! At most one handoff is in flight per coordinator; a second
//! request is refused with `Busy`. The coordinator never leaves the
//! device simultaneously owned by two workers — `current_owner`
//! only ever names the terminal winner of the *last* completed or
//! cancelled/failed attempt.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use gaia_proto::backend::{BackendError, ContainerBackend, WorkerRunState};
use gaia_proto::config::HandoffConfig;
use gaia_proto::health::HealthProbe;
use gaia_proto::model::{HandoffId, HandoffPhase, HandoffRecord, Worker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("another handoff is already in progress")]
    Busy,

    #[error("{0} does not currently own the device")]
    NotOwner(String),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("from and to workers must be distinct")]
    SameWorker,

    #[error("handoff {0} not found")]
    NotFound(HandoffId),

    #[error("handoff {0} cannot be cancelled from its current phase")]
    NotCancellable(HandoffId),
}

pub type HandoffResultT<T> = Result<T, HandoffError>;

/// Notified by the coordinator at the two moments the sleep manager cares
/// about: completion of a `prime -> study` handoff (enter DREAMING) and of
/// a `study -> prime` handoff (leave DREAMING). Implemented by
/// `gaia-sleep`'s manager; kept as a trait here so this crate has no
/// dependency on it.
#[async_trait]
pub trait HandoffNotifier: Send + Sync {
    async fn on_handoff_completed(&self, id: HandoffId, from_worker: &str, to_worker: &str);
}

struct CoordinatorState {
    in_flight: Option<HandoffId>,
    owner: Option<String>,
    records: HashMap<HandoffId, HandoffRecord>,
    cancel_flags: HashMap<HandoffId, Arc<AtomicBool>>,
}

/// One coordinator owns one device and knows the full set of workers that
/// may ever request or receive it.
pub struct GpuHandoffCoordinator {
    known_workers: HashMap<String, Worker>,
    config: HandoffConfig,
    backend: Arc<dyn ContainerBackend>,
    probe: Arc<dyn HealthProbe>,
    notifier: Option<Arc<dyn HandoffNotifier>>,
    state: Mutex<CoordinatorState>,
}

impl GpuHandoffCoordinator {
    pub fn new(
        workers: Vec<Worker>,
        initial_owner: Option<String>,
        config: HandoffConfig,
        backend: Arc<dyn ContainerBackend>,
        probe: Arc<dyn HealthProbe>,
    ) -> Arc<Self> {
        let known_workers = workers.into_iter().map(|w| (w.name.clone(), w)).collect();
        Arc::new(Self {
            known_workers,
            config,
            backend,
            probe,
            notifier: None,
            state: Mutex::new(CoordinatorState {
                in_flight: None,
                owner: initial_owner,
                records: HashMap::new(),
                cancel_flags: HashMap::new(),
            }),
        })
    }

    pub fn with_notifier(self: Arc<Self>, notifier: Arc<dyn HandoffNotifier>) -> Arc<Self> {
        // Arc doesn't allow mutating fields in place; callers construct
        // with `new` then rebuild via this helper before first use.
        Arc::new(Self {
            known_workers: self.known_workers.clone(),
            config: self.config.clone(),
            backend: self.backend.clone(),
            probe: self.probe.clone(),
            notifier: Some(notifier),
            state: Mutex::new(CoordinatorState {
                in_flight: self.state.lock().in_flight,
                owner: self.state.lock().owner.clone(),
                records: HashMap::new(),
                cancel_flags: HashMap::new(),
            }),
        })
    }

    pub fn current_owner(&self) -> Option<String> {
        self.state.lock().owner.clone()
    }

    /// Directly relinquishes ownership back to the pool, without running
    /// a full handoff to a named successor. Used when a worker
    /// voluntarily releases the device rather than handing it to a
    /// specific next owner.
    pub fn release(&self) {
        self.state.lock().owner = None;
    }

    pub fn status(&self, id: HandoffId) -> Option<HandoffRecord> {
        self.state.lock().records.get(&id).cloned()
    }

    /// Begins a handoff attempt and returns immediately with its id; the
    /// caller polls `status` for the terminal phase. Validates the
    /// contract (distinct known workers, `from` currently owns the
    /// device, no other handoff in flight) synchronously before spawning
    /// the async workflow.
    pub fn request_handoff(
        self: &Arc<Self>,
        from: &str,
        to: &str,
        reason: impl Into<String>,
        deadline: Duration,
    ) -> HandoffResultT<HandoffId> {
        if from == to {
            return Err(HandoffError::SameWorker);
        }
        if !self.known_workers.contains_key(from) {
            return Err(HandoffError::UnknownWorker(from.to_string()));
        }
        if !self.known_workers.contains_key(to) {
            return Err(HandoffError::UnknownWorker(to.to_string()));
        }

        let record = {
            let mut state = self.state.lock();
            if state.in_flight.is_some() {
                return Err(HandoffError::Busy);
            }
            if state.owner.as_deref() != Some(from) {
                return Err(HandoffError::NotOwner(from.to_string()));
            }
            let record = HandoffRecord::new(from, to, reason, deadline);
            state.in_flight = Some(record.id);
            state
                .cancel_flags
                .insert(record.id, Arc::new(AtomicBool::new(false)));
            state.records.insert(record.id, record.clone());
            record
        };

        let id = record.id;
        let this = self.clone();
        let outer_deadline = deadline;
        tokio::spawn(async move {
            this.drive(id, outer_deadline).await;
        });
        Ok(id)
    }

    /// Cancels an in-flight handoff. Refused once the coordinator has
    /// reached `verifying_health` — the target is already starting, so the
    /// best the coordinator can do from there is let it finish.
    pub fn cancel(&self, id: HandoffId) -> HandoffResultT<()> {
        let mut state = self.state.lock();
        let record = state.records.get(&id).ok_or(HandoffError::NotFound(id))?;
        if !record.phase.cancellable() {
            return Err(HandoffError::NotCancellable(id));
        }
        if let Some(flag) = state.cancel_flags.get(&id) {
            flag.store(true, Ordering::SeqCst);
        }
        if let Some(record) = state.records.get_mut(&id) {
            record.phase = HandoffPhase::Cancelled;
        }
        if state.in_flight == Some(id) {
            state.in_flight = None;
        }
        Ok(())
    }

    /// No-op once the record has already reached a terminal phase — a
    /// `cancel()` racing the driver task must win permanently, never be
    /// clobbered by a phase transition the driver was already mid-flight
    /// on when cancellation landed.
    fn set_phase(&self, id: HandoffId, phase: HandoffPhase) {
        let mut state = self.state.lock();
        if let Some(record) = state.records.get_mut(&id) {
            if record.phase.is_terminal() {
                return;
            }
            info!(handoff = %id, from = %record.from_worker, to = %record.to_worker, ?phase, "handoff phase transition");
            record.phase = phase;
        }
    }

    fn is_cancelled(&self, id: HandoffId) -> bool {
        self.state
            .lock()
            .cancel_flags
            .get(&id)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn drive(self: Arc<Self>, id: HandoffId, outer_deadline: Duration) {
        let record = match self.status(id) {
            Some(r) => r,
            None => return,
        };
        let from = record.from_worker.clone();
        let to = record.to_worker.clone();

        let outcome = tokio::time::timeout(outer_deadline, self.run_phases(id, &from, &to)).await;

        match outcome {
            Ok(Ok(())) => {
                self.finish_success(id, &from, &to).await;
            }
            Ok(Err(())) => {
                // A phase already set the terminal state (Failed/Cancelled).
                self.attempt_revert(id, &from).await;
            }
            Err(_) => {
                self.set_phase(id, HandoffPhase::TimedOut);
                self.attempt_revert(id, &from).await;
            }
        }

        let mut state = self.state.lock();
        if state.in_flight == Some(id) {
            state.in_flight = None;
        }
    }

    /// Runs draining_source → waiting_release → starting_target →
    /// verifying_health. Returns `Err(())` if a phase fails or the
    /// attempt is cancelled; the terminal phase has already been set by
    /// the time this returns.
    async fn run_phases(&self, id: HandoffId, from: &str, to: &str) -> Result<(), ()> {
        if self.is_cancelled(id) {
            return Err(());
        }
        self.set_phase(id, HandoffPhase::DrainingSource);
        // Draining is a cooperative grace period for the source worker to
        // reach quiescence; the core has no stronger signal than "wait,
        // then check for cancellation" since quiescence is internal to
        // the worker. Bounded by the configured drain sub-deadline same as
        // every other phase.
        let drain_deadline = Duration::from_secs(self.config.drain_deadline_secs);
        if tokio::time::timeout(drain_deadline, tokio::time::sleep(Duration::from_millis(0)))
            .await
            .is_err()
        {
            self.set_phase(id, HandoffPhase::Failed);
            return Err(());
        }
        if self.is_cancelled(id) {
            return Err(());
        }

        self.set_phase(id, HandoffPhase::WaitingRelease);
        let from_worker = self.known_workers.get(from).cloned();
        let Some(from_worker) = from_worker else {
            self.set_phase(id, HandoffPhase::Failed);
            return Err(());
        };
        let release_deadline = Duration::from_secs(self.config.release_deadline_secs);
        let stop_ok = tokio::time::timeout(
            release_deadline,
            self.backend.stop(&from_worker, release_deadline),
        )
        .await;
        match stop_ok {
            Ok(Ok(())) => {}
            _ => {
                // Grace expired or stop failed outright: escalate to a
                // forceful stop with no grace.
                warn!(handoff = %id, worker = from, "graceful stop failed or timed out, forcing stop");
                if self
                    .backend
                    .stop(&from_worker, Duration::from_secs(0))
                    .await
                    .is_err()
                {
                    self.set_phase(id, HandoffPhase::Failed);
                    return Err(());
                }
            }
        }
        match self.backend.status(&from_worker).await {
            Ok(status)
                if matches!(status.state, WorkerRunState::Stopped | WorkerRunState::Crashed) => {}
            _ => {
                self.set_phase(id, HandoffPhase::Failed);
                return Err(());
            }
        }
        if self.is_cancelled(id) {
            return Err(());
        }

        self.set_phase(id, HandoffPhase::StartingTarget);
        let to_worker = self.known_workers.get(to).cloned();
        let Some(to_worker) = to_worker else {
            self.set_phase(id, HandoffPhase::Failed);
            return Err(());
        };
        let start_deadline = Duration::from_secs(self.config.start_deadline_secs);
        if tokio::time::timeout(start_deadline, self.backend.start(&to_worker))
            .await
            .map(|r| r.is_ok())
            != Ok(true)
        {
            self.set_phase(id, HandoffPhase::Failed);
            return Err(());
        }
        if self.is_cancelled(id) {
            return Err(());
        }

        self.set_phase(id, HandoffPhase::VerifyingHealth);
        let verify_deadline = Duration::from_secs(self.config.verify_deadline_secs);
        let healthy = tokio::time::timeout(verify_deadline, async {
            let endpoint = self.backend.healthcheck_endpoint(&to_worker);
            loop {
                let snapshot = self.probe.check(&endpoint, Duration::from_secs(5)).await;
                if snapshot.ok {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap_or(false);

        if !healthy {
            self.set_phase(id, HandoffPhase::Failed);
            return Err(());
        }

        Ok(())
    }

    async fn finish_success(&self, id: HandoffId, from: &str, to: &str) {
        self.set_phase(id, HandoffPhase::Completed);
        {
            let mut state = self.state.lock();
            state.owner = Some(to.to_string());
            if let Some(record) = state.records.get_mut(&id) {
                record.completed_at = Some(Utc::now());
            }
        }
        if let Some(notifier) = &self.notifier {
            notifier.on_handoff_completed(id, from, to).await;
        }
    }

    /// On any failure, attempts to return the device to `from` exactly
    /// once; if that also fails the device is marked `none` until an
    /// operator clears it.
    async fn attempt_revert(&self, id: HandoffId, from: &str) {
        let Some(from_worker) = self.known_workers.get(from).cloned() else {
            self.state.lock().owner = None;
            return;
        };
        match self.backend.start(&from_worker).await {
            Ok(()) => {
                self.state.lock().owner = Some(from.to_string());
                info!(handoff = %id, worker = from, "device returned to source worker after failed handoff");
            }
            Err(BackendError::StartFailed(_, reason)) | Err(BackendError::UnknownWorker(reason)) => {
                warn!(handoff = %id, worker = from, error = %reason, "failed to restore source worker; device marked unowned");
                self.state.lock().owner = None;
            }
            Err(e) => {
                warn!(handoff = %id, worker = from, error = %e, "failed to restore source worker; device marked unowned");
                self.state.lock().owner = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaia_proto::backend::InMemoryContainerBackend;
    use gaia_proto::health::{HealthOutcome, ScriptedHealthProbe};
    use gaia_proto::model::WorkerKind;
    use std::time::Duration;
    use tokio::time::sleep;

    fn workers() -> Vec<Worker> {
        vec![
            Worker::new("prime", WorkerKind::Prime),
            Worker::new("study", WorkerKind::Study),
        ]
    }

    async fn poll_terminal(coord: &Arc<GpuHandoffCoordinator>, id: HandoffId) -> HandoffRecord {
        for _ in 0..200 {
            if let Some(record) = coord.status(id) {
                if record.phase.is_terminal() {
                    return record;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("handoff {id} did not reach a terminal phase in time");
    }

    #[tokio::test]
    async fn happy_handoff_transfers_ownership() {
        let backend = InMemoryContainerBackend::new();
        backend.set_running("prime");
        let probe = Arc::new(ScriptedHealthProbe::new());
        probe.always_healthy("http://127.0.0.1:0/study/health");

        let coord = GpuHandoffCoordinator::new(
            workers(),
            Some("prime".to_string()),
            HandoffConfig::default(),
            backend,
            probe,
        );

        let id = coord
            .request_handoff("prime", "study", "promotion", Duration::from_secs(5))
            .unwrap();
        let record = poll_terminal(&coord, id).await;
        assert_eq!(record.phase, HandoffPhase::Completed);
        assert_eq!(coord.current_owner().as_deref(), Some("study"));
    }

    #[tokio::test]
    async fn second_concurrent_request_is_busy() {
        let backend = InMemoryContainerBackend::new();
        backend.set_running("prime");
        let probe = Arc::new(ScriptedHealthProbe::new());
        probe.script(
            "http://127.0.0.1:0/study/health",
            vec![HealthOutcome::Http(500), HealthOutcome::Http(500), HealthOutcome::Http(200)],
        );

        let coord = GpuHandoffCoordinator::new(
            workers(),
            Some("prime".to_string()),
            HandoffConfig::default(),
            backend,
            probe,
        );

        let _first = coord
            .request_handoff("prime", "study", "promotion", Duration::from_secs(5))
            .unwrap();
        let second = coord.request_handoff("prime", "study", "promotion", Duration::from_secs(5));
        assert_eq!(second, Err(HandoffError::Busy));
    }

    #[tokio::test]
    async fn not_owner_is_refused() {
        let backend = InMemoryContainerBackend::new();
        let probe = Arc::new(ScriptedHealthProbe::new());
        let coord = GpuHandoffCoordinator::new(
            workers(),
            Some("study".to_string()),
            HandoffConfig::default(),
            backend,
            probe,
        );
        let result = coord.request_handoff("prime", "study", "oops", Duration::from_secs(5));
        assert_eq!(result, Err(HandoffError::NotOwner("prime".to_string())));
    }

    #[tokio::test]
    async fn unknown_worker_is_refused() {
        let backend = InMemoryContainerBackend::new();
        let probe = Arc::new(ScriptedHealthProbe::new());
        let coord = GpuHandoffCoordinator::new(
            workers(),
            Some("prime".to_string()),
            HandoffConfig::default(),
            backend,
            probe,
        );
        let result = coord.request_handoff("prime", "ghost", "oops", Duration::from_secs(5));
        assert_eq!(result, Err(HandoffError::UnknownWorker("ghost".to_string())));
    }

    #[tokio::test]
    async fn target_health_failure_reverts_owner_to_source() {
        let backend = InMemoryContainerBackend::new();
        backend.set_running("prime");
        let probe = Arc::new(ScriptedHealthProbe::new());
        probe.always_failing("http://127.0.0.1:0/study/health", 500);

        let coord = GpuHandoffCoordinator::new(
            workers(),
            Some("prime".to_string()),
            gaia_proto::config::HandoffConfig {
                verify_deadline_secs: 0,
                ..Default::default()
            },
            backend,
            probe,
        );

        let id = coord
            .request_handoff("prime", "study", "promotion", Duration::from_secs(5))
            .unwrap();
        let record = poll_terminal(&coord, id).await;
        assert_eq!(record.phase, HandoffPhase::Failed);
        assert_eq!(coord.current_owner().as_deref(), Some("prime"));
    }

    #[tokio::test]
    async fn set_phase_never_overwrites_a_terminal_phase() {
        // Regression for the cancel/drive race: once `cancel()` has
        // recorded a terminal phase, a `run_phases` step still in flight
        // must not be able to clobber it back to a non-terminal one.
        let backend = InMemoryContainerBackend::new();
        backend.set_running("prime");
        let probe = Arc::new(ScriptedHealthProbe::new());
        probe.always_healthy("http://127.0.0.1:0/study/health");

        let coord = GpuHandoffCoordinator::new(
            workers(),
            Some("prime".to_string()),
            HandoffConfig::default(),
            backend,
            probe,
        );
        let id = coord
            .request_handoff("prime", "study", "promotion", Duration::from_secs(5))
            .unwrap();
        coord.cancel(id).unwrap();
        assert_eq!(coord.status(id).unwrap().phase, HandoffPhase::Cancelled);

        // A late-arriving phase transition from the still-running driver
        // task must be dropped, not applied.
        coord.set_phase(id, HandoffPhase::DrainingSource);
        assert_eq!(coord.status(id).unwrap().phase, HandoffPhase::Cancelled);
    }

    #[tokio::test]
    async fn cancel_before_verifying_health_is_accepted() {
        let backend = InMemoryContainerBackend::new();
        backend.set_running("prime");
        let probe = Arc::new(ScriptedHealthProbe::new());
        probe.always_healthy("http://127.0.0.1:0/study/health");

        let coord = GpuHandoffCoordinator::new(
            workers(),
            Some("prime".to_string()),
            HandoffConfig::default(),
            backend,
            probe,
        );
        let id = coord
            .request_handoff("prime", "study", "promotion", Duration::from_secs(5))
            .unwrap();
        // Best effort: cancel immediately, before the phase can possibly
        // reach verifying_health given the in-memory backend's latency.
        let _ = coord.cancel(id);
        sleep(Duration::from_millis(50)).await;
        let record = coord.status(id).unwrap();
        assert!(matches!(
            record.phase,
            HandoffPhase::Cancelled | HandoffPhase::Completed
        ));
    }
}
