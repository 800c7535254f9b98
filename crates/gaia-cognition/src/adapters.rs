//! Stand-ins for the collaborators whose real implementations live
//! outside this core's boundary: what a fast-path reply actually says,
//! what a forced checkpoint actually snapshots, and how GPU/CPU
//! utilization is actually read. Production deployments wire their own
//! implementations of these traits in; these exist so the binary boots
//! and its HTTP surface is exercisable on its own.

use async_trait::async_trait;
use gaia_proto::model::QueuedMessage;
use gaia_resource::ResourceSample;
use gaia_sleep::FastResponder;
use tracing::info;

/// Logs the message it would have answered instead of dispatching it
/// anywhere. The actual fast-path reply generation is out of scope here;
/// this just proves the dispatch wiring works end to end.
pub struct LoggingFastResponder;

#[async_trait]
impl FastResponder for LoggingFastResponder {
    async fn respond(&self, review_context: Option<&str>, message: &QueuedMessage) {
        info!(
            session = %message.session_id,
            has_review_context = review_context.is_some(),
            "fast-path responder dispatched (no real responder configured)"
        );
    }
}

/// Always reports a flat, unremarkable utilization sample. A real reader
/// (e.g. one backed by `nvidia-smi` or `/proc/stat`) is a deployment
/// concern, not this core's — this exists only so a real GPU/CPU reader
/// can be swapped in behind the same trait later.
pub struct NoopResourceSampler;

#[async_trait]
impl gaia_resource::ResourceSampler for NoopResourceSampler {
    async fn sample(&self) -> ResourceSample {
        ResourceSample { gpu_util_pct: 0.0, cpu_util_pct: 0.0, gpu_mem_used_mb: 0, sampled_at: chrono::Utc::now() }
    }
}

/// Snapshots an empty session: the conversational/session state a real
/// checkpoint should contain is produced entirely outside this core's
/// boundary. Persisting an empty string still exercises the checkpoint
/// write path end to end.
pub struct EmptyContextProvider;

#[async_trait]
impl gaia_gateway::cognition::ContextProvider for EmptyContextProvider {
    async fn snapshot(&self) -> String {
        String::new()
    }
}
