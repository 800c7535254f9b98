//! PromotionPipeline (C12): a nine-stage fail-fast workflow that swaps a
//! pre-warmed candidate source tree into the live serving path.
//!
//! Stages 1-5 run before any file is touched; a failure there aborts
//! with nothing changed. Stages 6-9 are past the point of no return —
//! on failure the pipeline reports status and keeps backups rather than
//! attempting to revert files. A [`SafetyTrap`] is armed once stage 2
//! has actually stopped live services; the pipeline's caller is
//! responsible for checking it in its own error path and restarting
//! live if the pipeline aborted after arming it, since `Drop` cannot
//! await (see DESIGN.md).

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gaia_handoff::{GpuHandoffCoordinator, HandoffError};
use gaia_proto::backend::{BackendError, ContainerBackend};
use gaia_proto::health::HealthProbe;
use gaia_proto::model::{HandoffPhase, HandoffRecord, Worker};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PromoteError {
    #[error("gpu handoff failed: {0}")]
    Handoff(#[from] HandoffError),

    #[error("container backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("i/o error promoting {service}: {source}")]
    Io { service: String, source: std::io::Error },

    #[error("stage {0} failed: {1}")]
    StageFailed(String, String),
}

pub type PromoteResult<T> = Result<T, PromoteError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Passed,
    Failed(String),
    Skipped(String),
}

impl StageOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, StageOutcome::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct StageRecord {
    pub name: &'static str,
    pub outcome: StageOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Delegates to an externally-defined per-service validator (stage 4).
/// The core has no opinion on what "valid" means for a given service.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, service: &str) -> Result<(), String>;
}

/// Runs a cognitive test battery against a candidate endpoint (stage 5),
/// or a reduced subset against live (stage 7).
#[async_trait]
pub trait SmokeTestRunner: Send + Sync {
    async fn run(&self, endpoint: &str) -> Result<(), String>;
}

/// Rebuilds a service's container image after its source has been
/// promoted (stage 6). Distinct from `ContainerBackend::start`, which
/// only starts an already-built image.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn rebuild(&self, service: &str) -> Result<(), String>;
}

/// One promotable service. Libraries are listed before the services
/// that depend on them so stage 6 can promote in dependency order.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub live_source: PathBuf,
    pub candidate_source: PathBuf,
    pub backup_root: PathBuf,
    pub worker: Worker,
    pub candidate_endpoint: String,
    pub live_endpoint: String,
}

/// Operator-controlled knobs for one promotion run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub desired_gpu_owner: String,
    pub keep_live: bool,
    pub skip_validation: bool,
    pub skip_smoke: bool,
    pub skip_adapter_validation: bool,
    pub adapter_training_worker: Option<String>,
    pub gpu_deadline: Duration,
    pub shutdown_grace: Duration,
    pub health_poll_max: Duration,
    pub commit_journal: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            desired_gpu_owner: "prime".to_string(),
            keep_live: false,
            skip_validation: false,
            skip_smoke: false,
            skip_adapter_validation: true,
            adapter_training_worker: None,
            gpu_deadline: Duration::from_secs(180),
            shutdown_grace: Duration::from_secs(30),
            health_poll_max: Duration::from_secs(180),
            commit_journal: true,
        }
    }
}

/// Set once stage 2 has actually stopped live services. The pipeline's
/// caller checks `armed()` in its own top-level error path (a `main`
/// catching an `Err` from [`PromotionPipeline::run`]) and, if set,
/// restarts live services as a best-effort recovery — `Drop` cannot
/// await, so this cannot be done from a destructor.
#[derive(Clone, Default)]
pub struct SafetyTrap(Arc<AtomicBool>);

impl SafetyTrap {
    pub fn new() -> Self {
        Self::default()
    }

    fn arm(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn armed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct PromotionPipeline {
    options: PipelineOptions,
    services: Vec<ServiceSpec>,
    handoff: Arc<GpuHandoffCoordinator>,
    backend: Arc<dyn ContainerBackend>,
    probe: Arc<dyn HealthProbe>,
    validator: Option<Arc<dyn Validator>>,
    smoke: Option<Arc<dyn SmokeTestRunner>>,
    images: Option<Arc<dyn ImageBuilder>>,
    trap: SafetyTrap,
}

impl PromotionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: PipelineOptions,
        services: Vec<ServiceSpec>,
        handoff: Arc<GpuHandoffCoordinator>,
        backend: Arc<dyn ContainerBackend>,
        probe: Arc<dyn HealthProbe>,
        validator: Option<Arc<dyn Validator>>,
        smoke: Option<Arc<dyn SmokeTestRunner>>,
        images: Option<Arc<dyn ImageBuilder>>,
    ) -> Self {
        Self {
            options,
            services,
            handoff,
            backend,
            probe,
            validator,
            smoke,
            images,
            trap: SafetyTrap::new(),
        }
    }

    pub fn safety_trap(&self) -> SafetyTrap {
        self.trap.clone()
    }

    /// Runs all nine stages in order, stopping at the first failure.
    /// Returns the accumulated stage log regardless of outcome; callers
    /// inspect the last record's outcome (or `records.iter().any(is_failure)`)
    /// to decide the process exit code.
    pub async fn run(&self) -> Vec<StageRecord> {
        let mut records = Vec::new();

        macro_rules! run_stage {
            ($name:expr, $body:expr) => {{
                let started_at = Utc::now();
                let outcome = $body;
                let record = StageRecord { name: $name, outcome: outcome.clone(), started_at, finished_at: Utc::now() };
                info!(stage = $name, outcome = ?record.outcome, "promotion stage finished");
                records.push(record);
                if outcome.is_failure() {
                    return records;
                }
            }};
        }

        run_stage!("gpu_state_normalization", self.stage_gpu_normalization().await);
        run_stage!("graceful_live_shutdown", self.stage_graceful_shutdown().await);
        run_stage!("pre_flight_checks", self.stage_preflight().await);
        run_stage!("validation", self.stage_validation().await);
        run_stage!("smoke_tests", self.stage_smoke_tests().await);
        run_stage!("service_promotion", self.stage_service_promotion().await);
        run_stage!("post_promotion_verification", self.stage_post_promotion_verification().await);
        run_stage!("journal_and_commit", self.stage_journal(&records).await);
        run_stage!("adapter_validation", self.stage_adapter_validation().await);

        records
    }

    async fn stage_gpu_normalization(&self) -> StageOutcome {
        let current = self.handoff.current_owner();
        if current.as_deref() == Some(self.options.desired_gpu_owner.as_str()) {
            return StageOutcome::Passed;
        }
        let Some(from) = current else {
            return StageOutcome::Failed("device has no current owner to hand off from".to_string());
        };
        let id = match self.handoff.request_handoff(
            &from,
            &self.options.desired_gpu_owner,
            "promotion gpu normalization",
            self.options.gpu_deadline,
        ) {
            Ok(id) => id,
            Err(e) => return StageOutcome::Failed(e.to_string()),
        };
        match self.poll_handoff_terminal(id).await {
            Some(record) if record.phase == HandoffPhase::Completed => StageOutcome::Passed,
            Some(record) => StageOutcome::Failed(format!("handoff ended in {:?}", record.phase)),
            None => StageOutcome::Failed("handoff did not reach a terminal phase in time".to_string()),
        }
    }

    async fn poll_handoff_terminal(&self, id: gaia_proto::model::HandoffId) -> Option<HandoffRecord> {
        let deadline = tokio::time::Instant::now() + self.options.gpu_deadline;
        loop {
            if let Some(record) = self.handoff.status(id) {
                if record.phase.is_terminal() {
                    return Some(record);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn stage_graceful_shutdown(&self) -> StageOutcome {
        if self.options.keep_live {
            return StageOutcome::Skipped("--keep-live set".to_string());
        }
        for service in &self.services {
            let snapshot = self.probe.check(&service.candidate_endpoint, Duration::from_secs(5)).await;
            if !snapshot.ok {
                return StageOutcome::Failed(format!("candidate for {} is not healthy, refusing to shut down live", service.name));
            }
        }

        for service in &self.services {
            if let Err(e) = self.backend.stop(&service.worker, self.options.shutdown_grace).await {
                return StageOutcome::Failed(format!("failed to stop live {}: {e}", service.name));
            }
        }
        self.trap.arm();

        for service in &self.services {
            match self.backend.status(&service.worker).await {
                Ok(status) if matches!(status.state, gaia_proto::backend::WorkerRunState::Stopped) => {}
                Ok(status) => {
                    return StageOutcome::Failed(format!("live {} did not stop, state is {:?}", service.name, status.state));
                }
                Err(e) => return StageOutcome::Failed(format!("could not verify {} stopped: {e}", service.name)),
            }
        }
        StageOutcome::Passed
    }

    async fn stage_preflight(&self) -> StageOutcome {
        if !self.options.skip_smoke {
            for service in &self.services {
                let snapshot = self.probe.check(&service.candidate_endpoint, Duration::from_secs(5)).await;
                if !snapshot.ok {
                    return StageOutcome::Failed(format!("candidate endpoint for {} unreachable", service.name));
                }
            }
        }
        for service in &self.services {
            if !service.candidate_source.exists() {
                return StageOutcome::Failed(format!("candidate source missing for {}: {}", service.name, service.candidate_source.display()));
            }
        }
        StageOutcome::Passed
    }

    async fn stage_validation(&self) -> StageOutcome {
        if self.options.skip_validation {
            return StageOutcome::Skipped("validation disabled for this run".to_string());
        }
        let Some(validator) = &self.validator else {
            return StageOutcome::Skipped("no validator configured".to_string());
        };
        for service in &self.services {
            if let Err(reason) = validator.validate(&service.name).await {
                return StageOutcome::Failed(format!("{} failed validation: {reason}", service.name));
            }
        }
        StageOutcome::Passed
    }

    async fn stage_smoke_tests(&self) -> StageOutcome {
        if self.options.skip_smoke {
            return StageOutcome::Skipped("smoke tests disabled for this run".to_string());
        }
        let Some(smoke) = &self.smoke else {
            return StageOutcome::Skipped("no smoke test runner configured".to_string());
        };
        for service in &self.services {
            if let Err(reason) = smoke.run(&service.candidate_endpoint).await {
                return StageOutcome::Failed(format!("smoke tests failed against {}: {reason}", service.name));
            }
        }
        StageOutcome::Passed
    }

    /// Atomically replaces each service's live source with its candidate
    /// source, keeping a timestamped backup, then rebuilds images.
    /// Services are promoted in the order given to the pipeline — library
    /// services first, matching the dependency-order contract.
    async fn stage_service_promotion(&self) -> StageOutcome {
        let stamp = Utc::now().to_rfc3339();
        for service in &self.services {
            if let Err(e) = promote_one(service, &stamp) {
                return StageOutcome::Failed(format!("failed to promote {}: {e}", service.name));
            }
        }
        if let Some(images) = &self.images {
            for service in &self.services {
                if let Err(reason) = images.rebuild(&service.name).await {
                    return StageOutcome::Failed(format!("image rebuild failed for {}: {reason}", service.name));
                }
            }
        }
        StageOutcome::Passed
    }

    async fn stage_post_promotion_verification(&self) -> StageOutcome {
        for service in &self.services {
            if let Err(e) = self.backend.start(&service.worker).await {
                return StageOutcome::Failed(format!("failed to restart promoted {}: {e}", service.name));
            }
        }

        let deadline = tokio::time::Instant::now() + self.options.health_poll_max;
        for service in &self.services {
            let mut healthy = false;
            while tokio::time::Instant::now() < deadline {
                let snapshot = self.probe.check(&service.live_endpoint, Duration::from_secs(5)).await;
                if snapshot.ok {
                    healthy = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            if !healthy {
                return StageOutcome::Failed(format!("{} did not become healthy within the poll budget", service.name));
            }
        }

        if let Some(smoke) = &self.smoke {
            if let Some(service) = self.services.first() {
                if let Err(reason) = smoke.run(&service.live_endpoint).await {
                    return StageOutcome::Failed(format!("reduced post-promotion smoke subset failed: {reason}"));
                }
            }
        }
        StageOutcome::Passed
    }

    async fn stage_journal(&self, records: &[StageRecord]) -> StageOutcome {
        let journal = serde_json::json!({
            "promoted_at": Utc::now().to_rfc3339(),
            "stages": records.iter().map(|r| serde_json::json!({
                "name": r.name,
                "outcome": format!("{:?}", r.outcome),
            })).collect::<Vec<_>>(),
        });
        info!(journal = %journal, "promotion journal recorded");
        if !self.options.commit_journal {
            return StageOutcome::Skipped("journal commit disabled".to_string());
        }
        // Committing/pushing the journal to a VCS remote is an operator
        // concern outside this crate's boundary; recording it at INFO is
        // the core's contract.
        StageOutcome::Passed
    }

    async fn stage_adapter_validation(&self) -> StageOutcome {
        if self.options.skip_adapter_validation {
            return StageOutcome::Skipped("adapter validation disabled for this run".to_string());
        }
        let Some(training_worker) = &self.options.adapter_training_worker else {
            return StageOutcome::Skipped("no adapter training worker configured".to_string());
        };
        let id = match self.handoff.request_handoff(
            &self.options.desired_gpu_owner,
            training_worker,
            "adapter training",
            self.options.gpu_deadline,
        ) {
            Ok(id) => id,
            Err(e) => return StageOutcome::Failed(e.to_string()),
        };
        let Some(record) = self.poll_handoff_terminal(id).await else {
            return StageOutcome::Failed("handoff to training worker did not complete in time".to_string());
        };
        if record.phase != HandoffPhase::Completed {
            return StageOutcome::Failed(format!("handoff to training worker ended in {:?}", record.phase));
        }

        // Training + its own validation happen entirely inside the
        // training worker process; this pipeline only brokers the GPU.
        warn!("adapter training run is delegated to the training worker; this stage only brokers GPU ownership");

        let back = match self.handoff.request_handoff(
            training_worker,
            &self.options.desired_gpu_owner,
            "adapter training complete",
            self.options.gpu_deadline,
        ) {
            Ok(id) => id,
            Err(e) => return StageOutcome::Failed(e.to_string()),
        };
        match self.poll_handoff_terminal(back).await {
            Some(record) if record.phase == HandoffPhase::Completed => StageOutcome::Passed,
            Some(record) => StageOutcome::Failed(format!("handoff back from training worker ended in {:?}", record.phase)),
            None => StageOutcome::Failed("handoff back from training worker did not complete in time".to_string()),
        }
    }
}

fn promote_one(service: &ServiceSpec, stamp: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(&service.backup_root)?;
    let backup_path = service.backup_root.join(format!("{}-{stamp}", service.name));
    if service.live_source.exists() {
        std::fs::rename(&service.live_source, &backup_path)?;
    }
    std::fs::rename(&service.candidate_source, &service.live_source)?;
    Ok(())
}
