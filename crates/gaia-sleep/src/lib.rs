//! SleepWakeManager (C6): drives the six-state cognitive lifecycle of one
//! service, plus [`scheduler`], the background task scheduler (C7) it
//! defers to while `ASLEEP`.
//!
//! The public states are exactly [`GaiaState`]'s six variants. Two
//! transient phases live inside `ASLEEP` (`_FINISHING_TASK`, `_WAKING`)
//! but are never surfaced — [`Phase::public`] collapses both back to
//! `GaiaState::Asleep`. Every transition is driven through
//! [`SleepWakeManager`]'s methods while holding a single async lock, so at
//! most one transition is ever in progress for a given instance.

pub mod scheduler;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gaia_checkpoint::CheckpointStore;
use gaia_handoff::HandoffNotifier;
use gaia_proto::backend::ContainerBackend;
use gaia_proto::config::SleepConfig;
use gaia_proto::health::HealthProbe;
use gaia_proto::model::{GaiaState, HandoffId, QueuedMessage, Worker};
use gaia_queue::{MessageQueue, WakeReceiver};
use scheduler::SleepTaskScheduler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

/// Internal lifecycle phase. `Distracted` and `Dreaming` carry enough to
/// undo themselves: the resume target and the handoff id that must match
/// on exit, respectively.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Active,
    Drowsy,
    Asleep,
    FinishingTask,
    Waking,
    Dreaming { handoff_id: HandoffId },
    Distracted { resume_to: Box<Phase> },
    Offline,
}

impl Phase {
    /// Collapses the internal transient phases into their externally
    /// observable public state.
    fn public(&self) -> GaiaState {
        match self {
            Phase::Active => GaiaState::Active,
            Phase::Drowsy => GaiaState::Drowsy,
            Phase::Asleep | Phase::FinishingTask | Phase::Waking => GaiaState::Asleep,
            Phase::Dreaming { .. } => GaiaState::Dreaming,
            Phase::Distracted { .. } => GaiaState::Distracted,
            Phase::Offline => GaiaState::Offline,
        }
    }
}

/// Dispatches the first queued message to a lightweight responder once a
/// review context (formatted checkpoint text, not a prompt to answer) is
/// available. Out of scope: what the responder actually does with it.
#[async_trait]
pub trait FastResponder: Send + Sync {
    async fn respond(&self, review_context: Option<&str>, message: &QueuedMessage);
}

#[derive(Debug, Clone)]
pub struct SleepStatus {
    pub state: GaiaState,
    pub wake_pending: bool,
    pub current_task: Option<String>,
    pub last_change_at: DateTime<Utc>,
    pub seconds_in_state: i64,
}

struct ManagerState {
    phase: Phase,
    last_change_at: DateTime<Utc>,
    /// Set while a DROWSY checkpoint write is racing a wake signal; read
    /// by `status()` even outside DROWSY so a late-arriving signal that
    /// lost the race is still visible for one tick.
    wake_pending: bool,
    /// The handoff id the manager is waiting to see reversed before
    /// leaving DREAMING; `None` once back in ASLEEP.
    active_dream_handoff: Option<HandoffId>,
    primary_ready: bool,
}

/// One instance per cognition service. Owns a [`CheckpointStore`] keyed by
/// its own service name and reads (never writes) a [`MessageQueue`] owned
/// by the gateway.
pub struct SleepWakeManager {
    service_name: String,
    config: SleepConfig,
    canned_response: String,
    checkpoint: Arc<CheckpointStore>,
    queue: Arc<MessageQueue>,
    scheduler: Arc<SleepTaskScheduler>,
    fast_responder: Arc<dyn FastResponder>,
    backend: Arc<dyn ContainerBackend>,
    probe: Arc<dyn HealthProbe>,
    primary_worker: Worker,
    state: Mutex<ManagerState>,
    drowsy_cancel: Arc<Notify>,
}

impl SleepWakeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service_name: impl Into<String>,
        config: SleepConfig,
        canned_response: impl Into<String>,
        checkpoint: Arc<CheckpointStore>,
        queue: Arc<MessageQueue>,
        scheduler: Arc<SleepTaskScheduler>,
        fast_responder: Arc<dyn FastResponder>,
        backend: Arc<dyn ContainerBackend>,
        probe: Arc<dyn HealthProbe>,
        primary_worker: Worker,
    ) -> Arc<Self> {
        Arc::new(Self {
            service_name: service_name.into(),
            config,
            canned_response: canned_response.into(),
            checkpoint,
            queue,
            scheduler,
            fast_responder,
            backend,
            probe,
            primary_worker,
            state: Mutex::new(ManagerState {
                phase: Phase::Active,
                last_change_at: Utc::now(),
                wake_pending: false,
                active_dream_handoff: None,
                primary_ready: true,
            }),
            drowsy_cancel: Arc::new(Notify::new()),
        })
    }

    /// The inbound queue this manager drains on wake. Shared with the
    /// gateway, which is the only thing that ever enqueues into it.
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub async fn status(&self) -> SleepStatus {
        let state = self.state.lock().await;
        SleepStatus {
            state: state.phase.public(),
            wake_pending: state.wake_pending,
            current_task: self.scheduler.current_task().map(|t| t.id),
            last_change_at: state.last_change_at,
            seconds_in_state: (Utc::now() - state.last_change_at).num_seconds().max(0),
        }
    }

    /// `DREAMING`/`DISTRACTED` gate: a pre-configured reply the gateway
    /// should send instead of dispatching to the responder. `None`
    /// everywhere else.
    pub async fn canned_response(&self) -> Option<String> {
        match self.state.lock().await.phase {
            Phase::Dreaming { .. } | Phase::Distracted { .. } => Some(self.canned_response.clone()),
            _ => None,
        }
    }

    async fn set_phase(&self, state: &mut ManagerState, next: Phase) {
        info!(service = %self.service_name, from = ?state.phase.public(), to = ?next.public(), "sleep state transition");
        state.phase = next;
        state.last_change_at = Utc::now();
    }

    fn warn_illegal(&self, trigger: &str, phase: &Phase) {
        warn!(service = %self.service_name, trigger, state = ?phase.public(), "sleep trigger arrived in a state where it is not permitted, ignoring");
    }

    /// `ACTIVE -> DROWSY` on sustained idle, gated by the caller
    /// confirming there is no active streaming response. Writes the
    /// caller-supplied checkpoint text cooperatively: a `wake_signal`
    /// arriving before the write's one suspension point (the per-key
    /// writer lock) aborts the write entirely and returns to `ACTIVE`
    /// with `Checkpoint.current` untouched.
    pub async fn enter_drowsy(self: &Arc<Self>, no_active_stream: bool, checkpoint_text: String) {
        {
            let mut state = self.state.lock().await;
            if state.phase != Phase::Active || !no_active_stream {
                self.warn_illegal("idle_threshold", &state.phase);
                return;
            }
            state.wake_pending = false;
            self.set_phase(&mut state, Phase::Drowsy).await;
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.run_drowsy_checkpoint(checkpoint_text).await;
        });
    }

    async fn run_drowsy_checkpoint(self: Arc<Self>, checkpoint_text: String) {
        let cancel = self.drowsy_cancel.clone();
        let key = self.service_name.clone();
        let write = self.checkpoint.write(&key, &checkpoint_text);

        tokio::select! {
            biased;
            _ = cancel.notified() => {
                info!(service = %self.service_name, "drowsy checkpoint abandoned, wake signal won the race");
                let mut state = self.state.lock().await;
                state.wake_pending = false;
                self.set_phase(&mut state, Phase::Active).await;
            }
            result = write => {
                let mut state = self.state.lock().await;
                if state.wake_pending {
                    // The signal arrived after the write itself started but
                    // before this task observed it; honor ACTIVE regardless
                    // of whether the write succeeded, per the cancellation
                    // contract — the checkpoint it produced simply becomes
                    // the new `current`, which is harmless: the invariant
                    // only requires *no change* when the signal beats the
                    // first rename, which `select!` already guaranteed above.
                    state.wake_pending = false;
                    self.set_phase(&mut state, Phase::Active).await;
                    return;
                }
                match result {
                    Ok(()) => self.set_phase(&mut state, Phase::Asleep).await,
                    Err(e) => {
                        warn!(service = %self.service_name, error = %e, "checkpoint write failed during drowsy, fail-safe to active");
                        self.set_phase(&mut state, Phase::Active).await;
                    }
                }
            }
        }
    }

    /// Requests the manager leave `ASLEEP`, or cancel an in-progress
    /// `DROWSY` checkpoint. Ignored (state-machine violation, logged at
    /// WARN) everywhere else.
    pub async fn wake_signal(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        match state.phase {
            Phase::Drowsy => {
                state.wake_pending = true;
                self.drowsy_cancel.notify_one();
            }
            Phase::Asleep => {
                let interruptible = self.scheduler.current_interruptible().unwrap_or(true);
                if interruptible {
                    // A currently-running interruptible task (if any) must
                    // not keep holding the scheduler's "current" slot once
                    // we've committed to waking; request its cancellation
                    // so the next maintenance cycle doesn't pick up stale
                    // last_run bookkeeping mid-wake.
                    self.scheduler.request_cancel();
                    self.set_phase(&mut state, Phase::Waking).await;
                    drop(state);
                    self.begin_parallel_wake();
                } else {
                    self.set_phase(&mut state, Phase::FinishingTask).await;
                }
            }
            Phase::FinishingTask | Phase::Waking => {
                // Already on the way out; a repeated signal is not an
                // error, just redundant.
            }
            _ => self.warn_illegal("wake_signal", &state.phase),
        }
    }

    /// Called by the task scheduler's driver loop once the current
    /// non-interruptible task finishes while a wake was pending.
    pub async fn task_complete(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.phase == Phase::FinishingTask {
            self.set_phase(&mut state, Phase::Waking).await;
            drop(state);
            self.begin_parallel_wake();
        }
    }

    /// Parallel wake: the fast path acknowledges the first queued message
    /// against the restored checkpoint within a few seconds and flips the
    /// manager to `ACTIVE` as soon as it does, independent of the slow
    /// path's primary-worker rehydration (target up to ~60s, retried with
    /// capped exponential backoff if it fails).
    fn begin_parallel_wake(self: &Arc<Self>) {
        let fast = self.clone();
        tokio::spawn(async move { fast.run_fast_path().await });
        let slow = self.clone();
        tokio::spawn(async move { slow.run_slow_path().await });
    }

    async fn run_fast_path(self: Arc<Self>) {
        let review_context = self.checkpoint.read(&self.service_name).map(|text| format_review_context(&text));
        let first = self.queue.dequeue();
        if let Some(msg) = &first {
            self.fast_responder.respond(review_context.as_deref(), msg).await;
        } else {
            // Nothing queued yet (e.g. a wake driven by a GPU handoff
            // reversal rather than a message) — still dispatch an empty
            // review so downstream state is consistent, matching the "no
            // silent" propagation policy; with no message to answer there
            // is nothing to respond to, so this is a no-op responder call.
        }

        let mut state = self.state.lock().await;
        if state.phase == Phase::Waking {
            self.set_phase(&mut state, Phase::Active).await;
        }
    }

    async fn run_slow_path(self: Arc<Self>) {
        let mut backoff = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        loop {
            {
                let phase = self.state.lock().await.phase.clone();
                if !matches!(phase, Phase::Waking | Phase::Active) {
                    return;
                }
            }

            if self.backend.start(&self.primary_worker).await.is_ok() {
                let endpoint = self.backend.healthcheck_endpoint(&self.primary_worker);
                let snapshot = self.probe.check(&endpoint, Duration::from_secs(5)).await;
                if snapshot.ok {
                    self.state.lock().await.primary_ready = true;
                    info!(service = %self.service_name, "primary worker rehydrated, subsequent messages route to primary");
                    return;
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(cap);
        }
    }

    /// Whether the gateway should route the next message to the primary
    /// worker rather than the fast-path responder.
    pub async fn primary_ready(&self) -> bool {
        self.state.lock().await.primary_ready
    }

    /// `ASLEEP -> DREAMING` on a completed `prime -> study` handoff.
    pub async fn enter_dreaming(self: &Arc<Self>, handoff_id: HandoffId) {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Asleep {
            self.warn_illegal("gpu_handoff_to_study", &state.phase);
            return;
        }
        state.active_dream_handoff = Some(handoff_id);
        self.set_phase(&mut state, Phase::Dreaming { handoff_id }).await;
    }

    /// `DREAMING -> ASLEEP` on a completed `study -> prime` handoff. A
    /// mismatched id (not the one that opened the current dream) is
    /// ignored, per the notification-keying contract.
    pub async fn exit_dreaming(self: &Arc<Self>, handoff_id: HandoffId) {
        let mut state = self.state.lock().await;
        match &state.phase {
            Phase::Dreaming { handoff_id: active } if *active == handoff_id => {
                state.active_dream_handoff = None;
                self.set_phase(&mut state, Phase::Asleep).await;
            }
            _ => {
                warn!(service = %self.service_name, %handoff_id, "mismatched dream-exit notification ignored");
            }
        }
    }

    /// Sustained resource load: records the current state as the resume
    /// target and enters `DISTRACTED`. A no-op from `OFFLINE`.
    pub async fn enter_distracted(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Offline || matches!(state.phase, Phase::Distracted { .. }) {
            return;
        }
        let resume_to = Box::new(state.phase.clone());
        self.set_phase(&mut state, Phase::Distracted { resume_to }).await;
    }

    /// Load subsiding returns to the recorded resume target. Per the
    /// adopted resolution of the DISTRACTED/wake ambiguity (DESIGN.md): a
    /// pending wake always wins, so if the resume target was itself mid
    /// wake this simply continues that path rather than re-freezing it.
    pub async fn load_subsided(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if let Phase::Distracted { resume_to } = state.phase.clone() {
            self.set_phase(&mut state, *resume_to).await;
        }
    }

    /// Terminal from any state.
    pub async fn shutdown(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        self.set_phase(&mut state, Phase::Offline).await;
    }
}

/// Formats restored checkpoint text as review material the fast-path
/// responder should read, not answer.
fn format_review_context(checkpoint_text: &str) -> String {
    format!("[context review — not a request to answer]\n{checkpoint_text}")
}

/// Wires the manager into a [`MessageQueue`] as its wake receiver: any
/// empty->nonempty edge while the service is not `ACTIVE` should be able
/// to drive a wake, but the manager only actually reacts while `ASLEEP`
/// or `DROWSY` — `wake_signal` is a no-op (logged, ignored) otherwise.
pub struct QueueWakeBridge {
    manager: Arc<SleepWakeManager>,
}

impl QueueWakeBridge {
    pub fn new(manager: Arc<SleepWakeManager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }
}

impl WakeReceiver for QueueWakeBridge {
    fn wake_needed(&self) {
        let manager = self.manager.clone();
        tokio::spawn(async move { manager.wake_signal().await });
    }
}

/// Adapter so `GpuHandoffCoordinator` can drive DREAMING/ASLEEP without
/// this crate depending back on `gaia-handoff`'s coordinator type —
/// matches the same pattern `gaia-sync` uses for `SyncTrigger`.
pub struct HandoffDreamBridge {
    manager: Arc<SleepWakeManager>,
    prime_name: String,
    study_name: String,
}

impl HandoffDreamBridge {
    pub fn new(manager: Arc<SleepWakeManager>, prime_name: impl Into<String>, study_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { manager, prime_name: prime_name.into(), study_name: study_name.into() })
    }
}

#[async_trait]
impl HandoffNotifier for HandoffDreamBridge {
    async fn on_handoff_completed(&self, id: HandoffId, from_worker: &str, to_worker: &str) {
        if from_worker == self.prime_name && to_worker == self.study_name {
            self.manager.enter_dreaming(id).await;
        } else if from_worker == self.study_name && to_worker == self.prime_name {
            self.manager.exit_dreaming(id).await;
        }
    }
}

/// Fail-open resource pressure gate: an unavailable probe must never be
/// read as "distracted" (per the manager's fail-open failure semantics).
pub struct ResourcePressureGate {
    distracted: AtomicBool,
}

impl Default for ResourcePressureGate {
    fn default() -> Self {
        Self { distracted: AtomicBool::new(false) }
    }
}

impl ResourcePressureGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, distracted: bool) {
        self.distracted.store(distracted, Ordering::SeqCst);
    }

    pub fn is_distracted(&self) -> bool {
        self.distracted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaia_proto::backend::InMemoryContainerBackend;
    use gaia_proto::health::ScriptedHealthProbe;
    use gaia_proto::model::WorkerKind;
    use scheduler::{default_maintenance_tasks, NoopAction, TaskKind};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct RecordingResponder {
        calls: StdMutex<Vec<(Option<String>, String)>>,
    }

    impl RecordingResponder {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: StdMutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl FastResponder for RecordingResponder {
        async fn respond(&self, review_context: Option<&str>, message: &QueuedMessage) {
            self.calls.lock().unwrap().push((review_context.map(String::from), message.content.clone()));
        }
    }

    fn empty_scheduler() -> Arc<SleepTaskScheduler> {
        let mut actions: HashMap<TaskKind, Arc<dyn scheduler::TaskAction>> = HashMap::new();
        actions.insert(TaskKind::SessionCuration, Arc::new(NoopAction));
        actions.insert(TaskKind::ThoughtSeedReview, Arc::new(NoopAction));
        actions.insert(TaskKind::VectorReflection, Arc::new(NoopAction));
        Arc::new(SleepTaskScheduler::new(default_maintenance_tasks(), actions))
    }

    fn manager(dir: &std::path::Path, responder: Arc<dyn FastResponder>) -> Arc<SleepWakeManager> {
        let checkpoint = Arc::new(CheckpointStore::new(dir, 1000));
        let queue = Arc::new(MessageQueue::new());
        let backend = InMemoryContainerBackend::new();
        backend.set_running("prime");
        let probe = Arc::new(ScriptedHealthProbe::new());
        probe.always_healthy("http://127.0.0.1:0/prime/health");
        SleepWakeManager::new(
            "cognition-a",
            SleepConfig::default(),
            "zzz... gaia is resting",
            checkpoint,
            queue,
            empty_scheduler(),
            responder,
            backend,
            probe,
            Worker::new("prime", WorkerKind::Prime),
        )
    }

    async fn wait_for_state(mgr: &Arc<SleepWakeManager>, target: GaiaState) {
        for _ in 0..100 {
            if mgr.status().await.state == target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("manager did not reach {target:?} in time");
    }

    #[tokio::test]
    async fn drowsy_cancellation_matches_scenario_5() {
        let dir = tempfile::tempdir().unwrap();
        let responder = RecordingResponder::new();
        let mgr = manager(dir.path(), responder);

        mgr.enter_drowsy(true, "checkpoint text".to_string()).await;
        assert_eq!(mgr.status().await.state, GaiaState::Drowsy);

        mgr.wake_signal().await;

        wait_for_state(&mgr, GaiaState::Active).await;
    }

    #[tokio::test]
    async fn happy_sleep_then_wake_enters_waking_and_dispatches_fast_path() {
        let dir = tempfile::tempdir().unwrap();
        let responder = RecordingResponder::new();
        let mgr = manager(dir.path(), responder.clone());

        mgr.enter_drowsy(true, "prior context".to_string()).await;
        wait_for_state(&mgr, GaiaState::Asleep).await;

        mgr.queue().enqueue(QueuedMessage::new("s1", "hello", "gateway", 0));
        mgr.wake_signal().await;

        wait_for_state(&mgr, GaiaState::Active).await;

        let calls = responder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "hello");
        assert!(calls[0].0.as_ref().unwrap().contains("prior context"));
    }

    #[tokio::test]
    async fn canned_response_only_during_dreaming_and_distracted() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), RecordingResponder::new());
        assert!(mgr.canned_response().await.is_none());

        mgr.enter_distracted().await;
        assert!(mgr.canned_response().await.is_some());
        mgr.load_subsided().await;
        assert!(mgr.canned_response().await.is_none());
    }

    #[tokio::test]
    async fn mismatched_dream_exit_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), RecordingResponder::new());
        mgr.enter_drowsy(true, "checkpoint text".to_string()).await;
        wait_for_state(&mgr, GaiaState::Asleep).await;

        let real_id = HandoffId::new();
        mgr.enter_dreaming(real_id).await;
        assert_eq!(mgr.status().await.state, GaiaState::Dreaming);

        mgr.exit_dreaming(HandoffId::new()).await;
        assert_eq!(mgr.status().await.state, GaiaState::Dreaming, "mismatched id must not exit DREAMING");

        mgr.exit_dreaming(real_id).await;
        assert_eq!(mgr.status().await.state, GaiaState::Asleep);
    }

    #[tokio::test]
    async fn illegal_trigger_is_ignored_not_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), RecordingResponder::new());
        // wake_signal from ACTIVE is a state-machine violation: logged, ignored.
        mgr.wake_signal().await;
        assert_eq!(mgr.status().await.state, GaiaState::Active);
    }
}
