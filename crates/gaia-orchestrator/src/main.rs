//! gaia-orchestrator — GPU handoff coordinator, health watchdog, and HA
//! router, fronted by the orchestrator endpoint table.

mod config;
mod notify;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::GaiaConfig;
use gaia_ha::{FileMaintenanceFlag, HealthWatchdog, MaintenanceFlag, MemoryMaintenanceFlag, RoleTargets};
use gaia_gateway::orchestrator::{router, OrchestratorState};
use gaia_handoff::GpuHandoffCoordinator;
use gaia_proto::backend::InMemoryContainerBackend;
use gaia_proto::health::ScriptedHealthProbe;
use gaia_proto::model::{Worker, WorkerKind};
use gaia_sync::StateSyncer;
use notify::HttpHandoffNotifier;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "gaia-orchestrator")]
#[command(about = "GPU handoff coordinator and health watchdog daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: binds the HTTP surface and starts the watchdog loop.
    Run {
        #[arg(short, long, env = "GAIA_ORCHESTRATOR_CONFIG", default_value = "/etc/gaia/orchestrator.toml")]
        config: PathBuf,
    },
    /// Write a default config file to the given path.
    InitConfig {
        #[arg(short, long, default_value = "/etc/gaia/orchestrator.toml")]
        output: PathBuf,
    },
}

fn parse_worker_kind(kind: &str) -> anyhow::Result<WorkerKind> {
    match kind {
        "prime" => Ok(WorkerKind::Prime),
        "study" => Ok(WorkerKind::Study),
        "prime_candidate" => Ok(WorkerKind::PrimeCandidate),
        "study_candidate" => Ok(WorkerKind::StudyCandidate),
        other => anyhow::bail!("unknown worker kind: {other}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive("gaia_orchestrator=info".parse()?))
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

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = GaiaConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    info!(bind_addr = %config.bind_addr, workers = config.device_workers.len(), "starting gaia-orchestrator");

    let workers = config
        .device_workers
        .iter()
        .map(|w| parse_worker_kind(&w.kind).map(|kind| Worker::new(w.name.as_str(), kind)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    // No real process supervisor or HTTP health endpoint is in scope for
    // this core (out of scope per design); the in-memory/scripted doubles
    // stand in for a deployment's real ContainerBackend/HealthProbe.
    let backend = InMemoryContainerBackend::new();
    for worker in &workers {
        if config.initial_owner.as_deref() == Some(worker.name.as_str()) {
            backend.set_running(&worker.name);
        }
    }
    let probe = Arc::new(ScriptedHealthProbe::new());
    for worker in &workers {
        probe.always_healthy(&backend.healthcheck_endpoint(worker));
    }
    for role in &config.roles {
        probe.always_healthy(&role.primary);
        if let Some(fallback) = &role.fallback {
            probe.always_healthy(fallback);
        }
    }

    let coordinator = GpuHandoffCoordinator::new(
        workers.clone(),
        config.initial_owner.clone(),
        config.handoff.clone(),
        backend,
        probe.clone(),
    );

    let coordinator = match &config.cognition_endpoint {
        Some(endpoint) => {
            let prime = config.device_workers.iter().find(|w| w.kind == "prime").map(|w| w.name.clone());
            let study = config.device_workers.iter().find(|w| w.kind == "study").map(|w| w.name.clone());
            match (prime, study) {
                (Some(prime), Some(study)) => coordinator.with_notifier(Arc::new(HttpHandoffNotifier::new(endpoint.clone(), prime, study))),
                _ => {
                    warn!("cognition_endpoint configured but no prime/study worker pair found, handoff notifications disabled");
                    coordinator
                }
            }
        }
        None => coordinator,
    };

    let maintenance: Arc<dyn MaintenanceFlag> = match &config.maintenance_flag_path {
        Some(path) => Arc::new(FileMaintenanceFlag::new(path.clone())),
        None => Arc::new(MemoryMaintenanceFlag::new(false)),
    };

    let mut watchdog = HealthWatchdog::new(config.watchdog.clone(), probe, maintenance.clone());

    if let (Some(live), Some(candidate)) = (&config.state_sync_live_root, &config.state_sync_candidate_root) {
        let syncer = Arc::new(StateSyncer::new(
            live.clone(),
            candidate.clone(),
            config.state_sync_allowlist.clone(),
            maintenance,
            Duration::from_secs(config.state_sync.interval_secs),
        ));
        watchdog = watchdog.with_sync_trigger(syncer);
    }

    let watchdog = Arc::new(watchdog);
    for role in &config.roles {
        watchdog.register_role(
            role.role.clone(),
            RoleTargets {
                primary: role.primary.clone().into(),
                fallback: role.fallback.clone().map(Into::into),
            },
        );
    }

    let tick_interval = Duration::from_secs(config.watchdog.interval_secs);
    let watchdog_loop = watchdog.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        loop {
            ticker.tick().await;
            for event in watchdog_loop.tick().await {
                warn!(role = %event.role, from = %event.from, to = %event.to, "HA route change observed by watchdog loop");
            }
        }
    });

    let state = Arc::new(OrchestratorState { coordinator, watchdog });
    let app = gaia_gateway::with_standard_layers(router(state));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    axum::serve(listener, app).await.context("orchestrator HTTP server exited")?;
    Ok(())
}
