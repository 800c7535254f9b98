//! Route handlers for the cognition-service endpoint table.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use gaia_checkpoint::CheckpointStore;
use gaia_proto::model::HandoffId;
use gaia_sleep::SleepWakeManager;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Supplies the text a forced `/cognition/checkpoint` write persists.
/// The content of that text is produced entirely outside this core's
/// boundary (conversation/session state); this crate only knows how to
/// ask for a snapshot and persist it.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn snapshot(&self) -> String;
}

pub struct CognitionState {
    pub manager: Arc<SleepWakeManager>,
    pub checkpoint: Arc<CheckpointStore>,
    pub service_name: String,
    pub context: Arc<dyn ContextProvider>,
}

pub fn router(state: Arc<CognitionState>) -> Router {
    Router::new()
        .route("/cognition/checkpoint", post(force_checkpoint))
        .route("/sleep/wake", post(wake))
        .route("/sleep/status", get(status))
        .route("/sleep/study-handoff", post(study_handoff))
        .route("/sleep/canned-check", get(canned_check))
        .route("/sleep/shutdown", post(shutdown))
        .route("/health", get(health))
        .with_state(state)
}

async fn force_checkpoint(State(state): State<Arc<CognitionState>>) -> Json<Value> {
    let text = state.context.snapshot().await;
    let bytes_written = text.len();
    let ok = state.checkpoint.write(&state.service_name, &text).await.is_ok();
    Json(json!({"ok": ok, "bytes_written": bytes_written}))
}

async fn wake(State(state): State<Arc<CognitionState>>) -> Json<Value> {
    state.manager.wake_signal().await;
    let status = state.manager.status().await;
    Json(json!({"state": status.state, "timestamp": status.last_change_at}))
}

async fn status(State(state): State<Arc<CognitionState>>) -> Json<Value> {
    let status = state.manager.status().await;
    Json(json!({
        "state": status.state,
        "wake_pending": status.wake_pending,
        "current_task": status.current_task,
        "last_change_at": status.last_change_at,
        "seconds_in_state": status.seconds_in_state,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum HandoffDirection {
    ToStudy,
    ToPrime,
}

#[derive(Debug, Deserialize)]
struct StudyHandoffRequest {
    direction: HandoffDirection,
    handoff_id: HandoffId,
}

async fn study_handoff(
    State(state): State<Arc<CognitionState>>,
    Json(body): Json<StudyHandoffRequest>,
) -> Json<Value> {
    match body.direction {
        HandoffDirection::ToStudy => state.manager.enter_dreaming(body.handoff_id).await,
        HandoffDirection::ToPrime => state.manager.exit_dreaming(body.handoff_id).await,
    }
    let status = state.manager.status().await;
    Json(json!({"state": status.state}))
}

async fn canned_check(State(state): State<Arc<CognitionState>>) -> Json<Value> {
    let status = state.manager.status().await;
    let canned = state.manager.canned_response().await;
    Json(json!({"state": status.state, "canned_response": canned}))
}

async fn shutdown(State(state): State<Arc<CognitionState>>) -> Json<Value> {
    state.manager.shutdown().await;
    Json(json!({"state": "offline"}))
}

async fn health(State(state): State<Arc<CognitionState>>) -> impl IntoResponse {
    let status = state.manager.status().await;
    if status.state == gaia_proto::model::GaiaState::Offline {
        (StatusCode::SERVICE_UNAVAILABLE, "offline")
    } else {
        (StatusCode::OK, "ok")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use gaia_proto::backend::InMemoryContainerBackend;
    use gaia_proto::config::SleepConfig;
    use gaia_proto::health::ScriptedHealthProbe;
    use gaia_proto::model::{QueuedMessage, Worker, WorkerKind};
    use gaia_queue::MessageQueue;
    use gaia_sleep::FastResponder;
    use serde_json::Value;
    use std::collections::HashMap;
    use tower::ServiceExt;

    struct SilentResponder;

    #[async_trait]
    impl FastResponder for SilentResponder {
        async fn respond(&self, _review_context: Option<&str>, _message: &QueuedMessage) {}
    }

    struct StaticContext;

    #[async_trait]
    impl ContextProvider for StaticContext {
        async fn snapshot(&self) -> String {
            "snapshot text".to_string()
        }
    }

    fn empty_scheduler() -> Arc<gaia_sleep::scheduler::SleepTaskScheduler> {
        let actions: HashMap<gaia_sleep::scheduler::TaskKind, Arc<dyn gaia_sleep::scheduler::TaskAction>> =
            HashMap::new();
        Arc::new(gaia_sleep::scheduler::SleepTaskScheduler::new(Vec::new(), actions))
    }

    fn state(dir: &std::path::Path) -> Arc<CognitionState> {
        let checkpoint = Arc::new(CheckpointStore::new(dir, 1000));
        let queue = Arc::new(MessageQueue::new());
        let backend = InMemoryContainerBackend::new();
        backend.set_running("prime");
        let probe = Arc::new(ScriptedHealthProbe::new());
        probe.always_healthy("http://127.0.0.1:0/prime/health");
        let manager = SleepWakeManager::new(
            "cognition-a",
            SleepConfig::default(),
            "zzz... gaia is resting",
            checkpoint.clone(),
            queue,
            empty_scheduler(),
            Arc::new(SilentResponder),
            backend,
            probe,
            Worker::new("prime", WorkerKind::Prime),
        );
        Arc::new(CognitionState {
            manager,
            checkpoint,
            service_name: "cognition-a".to_string(),
            context: Arc::new(StaticContext),
        })
    }

    #[tokio::test]
    async fn status_reports_active_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(Request::builder().uri("/sleep/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["state"], "active");
    }

    #[tokio::test]
    async fn health_is_ok_while_not_offline() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn force_checkpoint_persists_context_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(Request::builder().method("POST").uri("/cognition/checkpoint").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["bytes_written"], "snapshot text".len());
    }
}
