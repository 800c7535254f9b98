//! Bridges `GpuHandoffCoordinator` completions to a cognition service
//! running in its own process, over the `/sleep/study-handoff` contract.
//! In-process deployments would reach for `gaia_sleep`'s
//! `HandoffDreamBridge` instead; this crate never links against
//! `gaia-sleep`, so the notification has to cross the wire.

use gaia_handoff::HandoffNotifier;
use gaia_proto::model::HandoffId;
use serde_json::json;
use tracing::warn;

pub struct HttpHandoffNotifier {
    client: reqwest::Client,
    cognition_endpoint: String,
    prime_name: String,
    study_name: String,
}

impl HttpHandoffNotifier {
    pub fn new(cognition_endpoint: impl Into<String>, prime_name: impl Into<String>, study_name: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .expect("failed to build HTTP client"),
            cognition_endpoint: cognition_endpoint.into(),
            prime_name: prime_name.into(),
            study_name: study_name.into(),
        }
    }
}

#[async_trait::async_trait]
impl HandoffNotifier for HttpHandoffNotifier {
    async fn on_handoff_completed(&self, id: HandoffId, from_worker: &str, to_worker: &str) {
        let direction = if from_worker == self.prime_name && to_worker == self.study_name {
            "to_study"
        } else if from_worker == self.study_name && to_worker == self.prime_name {
            "to_prime"
        } else {
            return;
        };

        let url = format!("{}/sleep/study-handoff", self.cognition_endpoint.trim_end_matches('/'));
        let body = json!({"direction": direction, "handoff_id": id});
        if let Err(e) = self.client.post(&url).json(&body).send().await {
            warn!(%url, error = %e, "failed to notify cognition service of completed handoff");
        }
    }
}
