//! gaia-promotectl — drives `gaia_promote::PromotionPipeline` against a
//! device's configured services, swapping a pre-warmed candidate source
//! tree into the live serving path.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::PlanConfig;
use gaia_handoff::GpuHandoffCoordinator;
use gaia_promote::{PipelineOptions, PromotionPipeline, ServiceSpec, StageOutcome};
use gaia_proto::backend::InMemoryContainerBackend;
use gaia_proto::health::ReqwestHealthProbe;
use gaia_proto::model::{Worker, WorkerKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "gaia-promotectl")]
#[command(about = "Promotion pipeline control for swapping candidate builds into live")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the nine-stage promotion pipeline described by a plan file.
    Run {
        #[arg(short, long, env = "GAIA_PROMOTE_PLAN", default_value = "/etc/gaia/promote.toml")]
        plan: PathBuf,

        /// Skip the graceful-shutdown stage, leaving live services running.
        #[arg(long)]
        keep_live: bool,

        /// Skip per-service validation (stage 4).
        #[arg(long)]
        skip_validation: bool,

        /// Skip candidate and reduced live smoke tests (stages 5 and 7).
        #[arg(long)]
        skip_smoke: bool,

        /// Run the adapter-validation training handoff (stage 9), off by default.
        #[arg(long)]
        run_adapter_validation: bool,
    },
    /// Write a default plan file to the given path.
    InitPlan {
        #[arg(short, long, default_value = "/etc/gaia/promote.toml")]
        output: PathBuf,
    },
}

fn worker_kind(name: &str) -> anyhow::Result<WorkerKind> {
    match name {
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
        .with(EnvFilter::from_default_env().add_directive("gaia_promotectl=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { plan, keep_live, skip_validation, skip_smoke, run_adapter_validation } => {
            run(plan, keep_live, skip_validation, skip_smoke, run_adapter_validation).await
        }
        Commands::InitPlan { output } => init_plan(output),
    }
}

fn init_plan(output: PathBuf) -> anyhow::Result<()> {
    PlanConfig::default().save(&output)?;
    println!("Plan written to {}", output.display());
    Ok(())
}

async fn run(
    plan_path: PathBuf,
    keep_live: bool,
    skip_validation: bool,
    skip_smoke: bool,
    run_adapter_validation: bool,
) -> anyhow::Result<()> {
    let plan = PlanConfig::load(&plan_path)
        .with_context(|| format!("loading plan from {}", plan_path.display()))?;
    info!(services = plan.services.len(), desired_owner = %plan.desired_gpu_owner, "starting promotion run");

    let workers = plan
        .known_workers
        .iter()
        .map(|name| worker_kind(name).map(|kind| Worker::new(name.as_str(), kind)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let backend = InMemoryContainerBackend::new();
    for worker in &workers {
        if plan.initial_owner.as_deref() == Some(worker.name.as_str()) {
            backend.set_running(&worker.name);
        }
    }
    for service in &plan.services {
        backend.set_running(&service.worker);
    }

    let probe = Arc::new(ReqwestHealthProbe::default());

    let coordinator = GpuHandoffCoordinator::new(
        workers,
        plan.initial_owner.clone(),
        plan.handoff.clone(),
        backend.clone(),
        probe.clone(),
    );

    let services = plan
        .services
        .iter()
        .map(|entry| {
            let kind = worker_kind(&entry.worker)?;
            Ok(ServiceSpec {
                name: entry.name.clone(),
                live_source: entry.live_source.clone(),
                candidate_source: entry.candidate_source.clone(),
                backup_root: entry.backup_root.clone(),
                worker: Worker::new(entry.worker.as_str(), kind),
                candidate_endpoint: entry.candidate_endpoint.clone(),
                live_endpoint: entry.live_endpoint.clone(),
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let options = PipelineOptions {
        desired_gpu_owner: plan.desired_gpu_owner.clone(),
        keep_live: keep_live || plan.keep_live,
        skip_validation: skip_validation || plan.skip_validation,
        skip_smoke: skip_smoke || plan.skip_smoke,
        skip_adapter_validation: !run_adapter_validation && plan.skip_adapter_validation,
        adapter_training_worker: plan.adapter_training_worker.clone(),
        gpu_deadline: Duration::from_secs(plan.gpu_deadline_secs),
        shutdown_grace: Duration::from_secs(plan.shutdown_grace_secs),
        health_poll_max: Duration::from_secs(plan.health_poll_max_secs),
        commit_journal: plan.commit_journal,
    };

    // No deployment-specific Validator, SmokeTestRunner, or ImageBuilder
    // is wired here; a device that needs one supplies its own binary
    // built against `gaia-promote`'s traits directly.
    let pipeline = Arc::new(PromotionPipeline::new(options, services, coordinator, backend.clone(), probe, None, None, None));
    let trap = pipeline.safety_trap();

    let run_handle = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run().await }
    });

    let records = tokio::select! {
        records = run_handle => records.context("promotion pipeline task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("external interrupt received during promotion");
            if trap.armed() {
                restart_live_services(&plan, &backend).await?;
            }
            anyhow::bail!("promotion aborted by external interrupt");
        }
    };

    for record in &records {
        match &record.outcome {
            StageOutcome::Passed => info!(stage = record.name, "stage passed"),
            StageOutcome::Skipped(reason) => info!(stage = record.name, %reason, "stage skipped"),
            StageOutcome::Failed(reason) => error!(stage = record.name, %reason, "stage failed"),
        }
    }

    let failed = records.iter().any(|r| r.outcome.is_failure());
    if failed {
        if trap.armed() {
            restart_live_services(&plan, &backend).await?;
        }
        anyhow::bail!("promotion pipeline failed, see stage log above");
    }

    info!("promotion completed successfully");
    Ok(())
}

/// The safety trap's actual recovery action: best-effort restart of every
/// live service, called from both the normal failure path and an external
/// interrupt arriving mid-run.
async fn restart_live_services(plan: &PlanConfig, backend: &InMemoryContainerBackend) -> anyhow::Result<()> {
    warn!("promotion aborted after stopping live services, restarting them as a best-effort recovery");
    for service in &plan.services {
        let worker = Worker::new(service.worker.as_str(), worker_kind(&service.worker)?);
        if let Err(e) = backend.start(&worker).await {
            error!(service = %service.name, error = %e, "failed to restart live service after aborted promotion");
        }
    }
    Ok(())
}
