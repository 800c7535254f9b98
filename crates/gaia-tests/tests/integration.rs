//! Cross-crate integration tests for the GAIA orchestration core.
//!
//! Each test exercises a real combination of the library crates rather
//! than a single crate's unit surface:
//! - GPU handoff completion driving the sleep/wake manager into DREAMING and back
//! - HA route hysteresis driving a StateSyncer's incremental replication
//! - Promotion pipeline abort-after-shutdown recovery via the safety trap
//! - Concurrent producers preserving message queue ordering under edge-triggered wake

use async_trait::async_trait;
use gaia_checkpoint::CheckpointStore;
use gaia_ha::{HealthWatchdog, MaintenanceFlag, MemoryMaintenanceFlag, RoleTargets};
use gaia_handoff::GpuHandoffCoordinator;
use gaia_promote::{PipelineOptions, PromotionPipeline, ServiceSpec};
use gaia_proto::backend::InMemoryContainerBackend;
use gaia_proto::config::{HandoffConfig, SleepConfig, WatchdogConfig};
use gaia_proto::health::ScriptedHealthProbe;
use gaia_proto::model::{GaiaState, QueuedMessage, Worker, WorkerKind};
use gaia_queue::MessageQueue;
use gaia_sleep::scheduler::{default_maintenance_tasks, NoopAction, SleepTaskScheduler, TaskKind};
use gaia_sleep::{HandoffDreamBridge, QueueWakeBridge, SleepWakeManager};
use gaia_sync::StateSyncer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ─── Helpers ──────────────────────────────────────────────────────────────────

struct SilentResponder;

#[async_trait]
impl gaia_sleep::FastResponder for SilentResponder {
    async fn respond(&self, _review_context: Option<&str>, _message: &QueuedMessage) {}
}

fn empty_scheduler() -> Arc<SleepTaskScheduler> {
    let mut actions: HashMap<TaskKind, Arc<dyn gaia_sleep::scheduler::TaskAction>> = HashMap::new();
    actions.insert(TaskKind::SessionCuration, Arc::new(NoopAction));
    actions.insert(TaskKind::ThoughtSeedReview, Arc::new(NoopAction));
    actions.insert(TaskKind::VectorReflection, Arc::new(NoopAction));
    Arc::new(SleepTaskScheduler::new(default_maintenance_tasks(), actions))
}

async fn wait_for_state(mgr: &Arc<SleepWakeManager>, target: GaiaState) {
    for _ in 0..200 {
        if mgr.status().await.state == target {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("manager did not reach {target:?} in time");
}

async fn wait_for_owner(coord: &Arc<GpuHandoffCoordinator>, owner: &str) {
    for _ in 0..400 {
        if coord.current_owner().as_deref() == Some(owner) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("coordinator never settled on owner {owner}");
}

// ─── Test 1: happy handoff drives the cognition service into DREAMING and back ─

#[tokio::test]
async fn completed_handoff_drives_dreaming_then_back_to_asleep() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = Arc::new(CheckpointStore::new(dir.path(), 100));
    let queue = Arc::new(MessageQueue::new());
    let sleep_backend = InMemoryContainerBackend::new();
    sleep_backend.set_running("prime");
    let sleep_probe = Arc::new(ScriptedHealthProbe::new());
    sleep_probe.always_healthy("http://127.0.0.1:0/prime/health");

    let manager = SleepWakeManager::new(
        "cognition-a",
        SleepConfig::default(),
        "zzz... resting",
        checkpoint,
        queue,
        empty_scheduler(),
        Arc::new(SilentResponder),
        sleep_backend,
        sleep_probe,
        Worker::new("prime", WorkerKind::Prime),
    );

    manager.enter_drowsy(true, "pre-sleep context".to_string()).await;
    wait_for_state(&manager, GaiaState::Asleep).await;

    let handoff_backend = InMemoryContainerBackend::new();
    handoff_backend.set_running("prime");
    let handoff_probe = Arc::new(ScriptedHealthProbe::new());
    handoff_probe.always_healthy(&handoff_backend.healthcheck_endpoint(&Worker::new("prime", WorkerKind::Prime)));
    handoff_probe.always_healthy(&handoff_backend.healthcheck_endpoint(&Worker::new("study", WorkerKind::Study)));

    let coordinator = GpuHandoffCoordinator::new(
        vec![Worker::new("prime", WorkerKind::Prime), Worker::new("study", WorkerKind::Study)],
        Some("prime".to_string()),
        HandoffConfig::default(),
        handoff_backend,
        handoff_probe,
    )
    .with_notifier(HandoffDreamBridge::new(manager.clone(), "prime", "study"));

    let id = coordinator.request_handoff("prime", "study", "nightly dream cycle", Duration::from_secs(5)).unwrap();
    wait_for_owner(&coordinator, "study").await;
    wait_for_state(&manager, GaiaState::Dreaming).await;
    assert!(manager.canned_response().await.is_some());

    let back = coordinator.request_handoff("study", "prime", "dream cycle complete", Duration::from_secs(5)).unwrap();
    assert_ne!(id, back);
    wait_for_owner(&coordinator, "prime").await;
    wait_for_state(&manager, GaiaState::Asleep).await;
    assert!(manager.canned_response().await.is_none());
}

// ─── Test 2: HA failover drives StateSyncer's one-way incremental sync ─────────

#[tokio::test]
async fn ha_tick_drives_state_sync_only_while_not_in_maintenance() {
    let dir = tempfile::tempdir().unwrap();
    let live = dir.path().join("live");
    let candidate = dir.path().join("candidate");
    std::fs::create_dir_all(&live).unwrap();
    std::fs::create_dir_all(&candidate).unwrap();
    std::fs::write(live.join("session.json"), b"{\"turn\":1}").unwrap();

    let maintenance = Arc::new(MemoryMaintenanceFlag::new(false));
    let syncer = Arc::new(StateSyncer::new(
        live.clone(),
        candidate.clone(),
        vec!["session.json".into()],
        maintenance.clone() as Arc<dyn MaintenanceFlag>,
        Duration::from_secs(5),
    ));

    let probe = Arc::new(ScriptedHealthProbe::new());
    probe.always_healthy("live-core");
    probe.always_healthy("candidate-core");
    let watchdog = HealthWatchdog::new(WatchdogConfig::default(), probe, maintenance.clone()).with_sync_trigger(syncer);
    watchdog.register_role("core", RoleTargets { primary: "live-core".into(), fallback: Some("candidate-core".into()) });

    watchdog.tick().await;
    assert_eq!(std::fs::read(candidate.join("session.json")).unwrap(), b"{\"turn\":1}");

    // Candidate never writes back into live: mutate candidate, tick
    // again, and confirm live is untouched.
    std::fs::write(candidate.join("session.json"), b"candidate-local-edit").unwrap();
    maintenance.set(true);
    watchdog.tick().await;
    assert_eq!(std::fs::read(live.join("session.json")).unwrap(), b"{\"turn\":1}");
}

// ─── Test 3: promotion abort after live shutdown recovers via the safety trap ──

#[tokio::test]
async fn aborted_promotion_after_shutdown_restarts_live_via_safety_trap() {
    let dir = tempfile::tempdir().unwrap();
    let live = dir.path().join("cognition-live");
    let candidate = dir.path().join("cognition-candidate");
    std::fs::create_dir_all(&live).unwrap();
    std::fs::write(live.join("marker"), b"live").unwrap();
    // No candidate directory: stage 3 (pre-flight) fails after stage 2 has
    // already stopped live, so the trap must be armed at that point.

    let worker = Worker::new("cognition-worker", WorkerKind::Prime);
    let backend = InMemoryContainerBackend::new();
    backend.set_running(&worker.name);
    let probe = Arc::new(ScriptedHealthProbe::new());
    probe.always_healthy("http://127.0.0.1:0/cognition/candidate/health");
    probe.always_healthy("http://127.0.0.1:0/cognition/live/health");

    let handoff_probe = Arc::new(ScriptedHealthProbe::new());
    let coordinator = GpuHandoffCoordinator::new(
        vec![Worker::new("prime", WorkerKind::Prime), Worker::new("study", WorkerKind::Study)],
        Some("prime".to_string()),
        HandoffConfig::default(),
        InMemoryContainerBackend::new(),
        handoff_probe,
    );

    let service = ServiceSpec {
        name: "cognition".to_string(),
        live_source: live.clone(),
        candidate_source: candidate,
        backup_root: dir.path().join("backups"),
        worker: worker.clone(),
        candidate_endpoint: "http://127.0.0.1:0/cognition/candidate/health".to_string(),
        live_endpoint: "http://127.0.0.1:0/cognition/live/health".to_string(),
    };

    let options = PipelineOptions { skip_validation: true, ..PipelineOptions::default() };
    let pipeline = PromotionPipeline::new(options, vec![service], coordinator, backend.clone(), probe, None, None, None);
    let trap = pipeline.safety_trap();

    let records = pipeline.run().await;
    assert!(records.iter().any(|r| r.outcome.is_failure()));
    assert!(trap.armed(), "stage 2 must have armed the trap before stage 3 found the missing candidate");
    assert_eq!(std::fs::read(live.join("marker")).unwrap(), b"live", "pipeline never touches files before stage 6");

    // Best-effort recovery a caller performs after observing the trap, per
    // gaia-promotectl's top-level error path.
    if trap.armed() {
        backend.start(&worker).await.unwrap();
        // A second start on an already-running worker must be a no-op.
        backend.start(&worker).await.unwrap();
    }
    let status = backend.status(&worker).await.unwrap();
    assert!(matches!(status.state, gaia_proto::backend::WorkerRunState::Running));
}

// ─── Test 4: concurrent producers preserve priority/FIFO ordering under wake ───

#[tokio::test]
async fn concurrent_enqueues_preserve_ordering_and_fire_wake_exactly_once() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReceiver(Arc<AtomicUsize>);
    impl gaia_queue::WakeReceiver for CountingReceiver {
        fn wake_needed(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let wake_count = Arc::new(AtomicUsize::new(0));
    let queue = Arc::new(MessageQueue::with_receiver(Arc::new(CountingReceiver(wake_count.clone()))));

    let mut handles = Vec::new();
    for i in 0..20u32 {
        let queue = queue.clone();
        let priority = if i % 4 == 0 { 10 } else { 0 };
        handles.push(tokio::spawn(async move {
            queue.enqueue(QueuedMessage::new("session", format!("msg-{i}"), "gateway", priority));
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    // All 20 arrived on an empty queue from a cold start: exactly one
    // empty->nonempty edge regardless of how many tasks raced to enqueue.
    assert_eq!(wake_count.load(Ordering::SeqCst), 1);

    let mut drained = Vec::new();
    while let Some(msg) = queue.dequeue() {
        drained.push(msg.content);
    }
    assert_eq!(drained.len(), 20);

    let index_of = |content: &str| -> u32 { content.trim_start_matches("msg-").parse().unwrap() };
    // All 5 priority-10 messages must dequeue before any priority-0 message.
    for content in drained.iter().take(5) {
        assert_eq!(index_of(content) % 4, 0, "{content} should have been a high-priority message");
    }
    for content in drained.iter().skip(5) {
        assert_ne!(index_of(content) % 4, 0, "{content} should have been a low-priority message");
    }
}
