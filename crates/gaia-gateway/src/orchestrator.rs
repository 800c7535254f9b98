//! Route handlers for the orchestrator endpoint table.

use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use gaia_ha::HealthWatchdog;
use gaia_handoff::GpuHandoffCoordinator;
use gaia_proto::model::HandoffId;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub struct OrchestratorState {
    pub coordinator: Arc<GpuHandoffCoordinator>,
    pub watchdog: Arc<HealthWatchdog>,
}

pub fn router(state: Arc<OrchestratorState>) -> Router {
    Router::new()
        .route("/gpu/status", get(gpu_status))
        .route("/handoff/:direction", post(request_handoff))
        .route("/handoff/:id/status", get(handoff_status))
        .route("/gpu/release", post(gpu_release))
        .route("/status", get(status))
        .with_state(state)
}

async fn gpu_status(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    let owner = state.coordinator.current_owner().unwrap_or_else(|| "none".to_string());
    Json(json!({"owner": owner}))
}

#[derive(Debug, Deserialize)]
struct HandoffRequest {
    reason: String,
    timeout_seconds: u64,
}

async fn request_handoff(
    State(state): State<Arc<OrchestratorState>>,
    Path(direction): Path<String>,
    Json(body): Json<HandoffRequest>,
) -> Result<Json<Value>, (axum::http::StatusCode, String)> {
    let (from, to) = match direction.as_str() {
        "prime-to-study" => ("prime", "study"),
        "study-to-prime" => ("study", "prime"),
        other => {
            return Err((axum::http::StatusCode::NOT_FOUND, format!("unknown handoff direction: {other}")));
        }
    };
    let deadline = Duration::from_secs(body.timeout_seconds);
    match state.coordinator.request_handoff(from, to, body.reason, deadline) {
        Ok(id) => Ok(Json(json!({"handoff_id": id}))),
        Err(e) => Err((axum::http::StatusCode::CONFLICT, e.to_string())),
    }
}

async fn handoff_status(
    State(state): State<Arc<OrchestratorState>>,
    Path(id): Path<HandoffId>,
) -> Result<Json<Value>, axum::http::StatusCode> {
    state
        .coordinator
        .status(id)
        .map(|record| Json(serde_json::to_value(record).unwrap_or(Value::Null)))
        .ok_or(axum::http::StatusCode::NOT_FOUND)
}

async fn gpu_release(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    state.coordinator.release();
    Json(json!({"ok": true}))
}

async fn status(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    Json(json!({
        "health_watchdog": {
            "ha_status": state.watchdog.ha_status(),
        },
    }))
}
