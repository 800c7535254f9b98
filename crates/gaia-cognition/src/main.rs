//! gaia-cognition — the sleep/wake manager, message queue, and
//! checkpoint store for one cognition service, fronted by the
//! cognition-service endpoint table.

mod adapters;
mod config;

use adapters::{EmptyContextProvider, LoggingFastResponder, NoopResourceSampler};
use anyhow::Context;
use clap::{Parser, Subcommand};
use config::GaiaConfig;
use gaia_checkpoint::CheckpointStore;
use gaia_gateway::cognition::{router, CognitionState};
use gaia_proto::backend::InMemoryContainerBackend;
use gaia_proto::health::ScriptedHealthProbe;
use gaia_proto::model::{GaiaState, Worker, WorkerKind};
use gaia_queue::MessageQueue;
use gaia_resource::{DistractionConfig, DistractionDetector, ResourceSampler};
use gaia_sleep::scheduler::{default_maintenance_tasks, NoopAction, SleepTaskScheduler, TaskKind};
use gaia_sleep::{QueueWakeBridge, SleepWakeManager};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "gaia-cognition")]
#[command(about = "Sleep/wake manager and checkpoint store daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: binds the HTTP surface and starts the idle/distraction watchers.
    Run {
        #[arg(short, long, env = "GAIA_COGNITION_CONFIG", default_value = "/etc/gaia/cognition.toml")]
        config: PathBuf,
    },
    /// Write a default config file to the given path.
    InitConfig {
        #[arg(short, long, default_value = "/etc/gaia/cognition.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive("gaia_cognition=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::InitConfig { output } => init_config(output),
    }
}

fn init_config(output: PathBuf) -> anyhow::Result<()> {
    GaiaConfig::default().save(&output)?;
    println!("Config written to {}", output.display());
    Ok(())
}

fn empty_scheduler() -> Arc<SleepTaskScheduler> {
    let mut actions: HashMap<TaskKind, Arc<dyn gaia_sleep::scheduler::TaskAction>> = HashMap::new();
    actions.insert(TaskKind::SessionCuration, Arc::new(NoopAction));
    actions.insert(TaskKind::ThoughtSeedReview, Arc::new(NoopAction));
    actions.insert(TaskKind::VectorReflection, Arc::new(NoopAction));
    Arc::new(SleepTaskScheduler::new(default_maintenance_tasks(), actions))
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = GaiaConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    info!(bind_addr = %config.bind_addr, service = %config.service_name, "starting gaia-cognition");

    let checkpoint = Arc::new(CheckpointStore::new(config.checkpoint_root.clone(), config.checkpoint_history_max_entries));
    let queue = Arc::new(MessageQueue::new());
    let scheduler = empty_scheduler();

    // Same doubles-for-externals pattern as gaia-orchestrator: no real
    // process supervisor or HTTP health endpoint is wired until a
    // deployment supplies one.
    let backend = InMemoryContainerBackend::new();
    backend.set_running(&config.primary_worker);
    let probe = Arc::new(ScriptedHealthProbe::new());
    let primary_worker = Worker::new(config.primary_worker.clone(), WorkerKind::Prime);
    probe.always_healthy(&backend.healthcheck_endpoint(&primary_worker));

    let manager = SleepWakeManager::new(
        config.service_name.clone(),
        config.sleep.clone(),
        config.canned_response.clone(),
        checkpoint.clone(),
        queue.clone(),
        scheduler.clone(),
        Arc::new(LoggingFastResponder),
        backend,
        probe,
        primary_worker,
    );

    queue.bind_receiver(QueueWakeBridge::new(manager.clone()));

    let distraction_config = DistractionConfig {
        threshold_pct: config.distraction.threshold_pct,
        window_samples: config.distraction.window_samples,
    };

    tokio::spawn(run_idle_watcher(manager.clone(), Duration::from_secs(config.sleep.idle_threshold_secs)));
    tokio::spawn(run_sleep_task_driver(manager.clone(), scheduler));
    tokio::spawn(run_resource_watcher(manager.clone(), distraction_config, Duration::from_secs(config.resource_poll_secs)));

    let state = Arc::new(CognitionState {
        manager,
        checkpoint,
        service_name: config.service_name.clone(),
        context: Arc::new(EmptyContextProvider),
    });
    let app = gaia_gateway::with_standard_layers(router(state));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    axum::serve(listener, app).await.context("cognition-service HTTP server exited")?;
    Ok(())
}

/// `ACTIVE -> DROWSY` once the service has been in `ACTIVE` for at least
/// `idle_threshold`. This binary has no notion of an in-flight streaming
/// response (that lives in the gateway the manager serves), so
/// `no_active_stream` is always asserted true here; a gateway embedding
/// this manager directly would pass its own liveness instead.
async fn run_idle_watcher(manager: Arc<SleepWakeManager>, idle_threshold: Duration) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let status = manager.status().await;
        if status.state == GaiaState::Active && status.seconds_in_state >= idle_threshold.as_secs() as i64 {
            let checkpoint_text = format!("idle checkpoint at {}", chrono::Utc::now());
            manager.enter_drowsy(true, checkpoint_text).await;
        }
    }
}

/// Drives the background task scheduler while `ASLEEP`: picks the next
/// task, runs it to completion, then calls `task_complete` unconditionally
/// (a no-op unless the manager is actually waiting on this task's finish).
async fn run_sleep_task_driver(manager: Arc<SleepWakeManager>, scheduler: Arc<SleepTaskScheduler>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        ticker.tick().await;
        if manager.status().await.state != GaiaState::Asleep {
            continue;
        }
        if scheduler.current_task().is_some() {
            continue;
        }
        let Some(task) = scheduler.next_task() else { continue };
        let scheduler = scheduler.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            scheduler.execute(task).await;
            manager.task_complete().await;
        });
    }
}

/// Polls the configured `ResourceSampler` and feeds a `DistractionDetector`,
/// driving the manager's `DISTRACTED` transition on sustained high
/// utilization and `load_subsided` once it clears. A sample that doesn't
/// arrive within the poll interval is treated as probe unavailability
/// (fail-open).
async fn run_resource_watcher(manager: Arc<SleepWakeManager>, config: DistractionConfig, interval: Duration) {
    let sampler = NoopResourceSampler;
    let detector = DistractionDetector::new(config);
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match tokio::time::timeout(interval, sampler.sample()).await {
            Ok(sample) => {
                detector.observe(&sample);
            }
            Err(_) => {
                warn!("resource sampler did not respond within its poll interval, treating as unavailable");
                detector.observe_unavailable();
            }
        }
        if detector.is_distracted() {
            manager.enter_distracted().await;
        } else {
            manager.load_subsided().await;
        }
    }
}
