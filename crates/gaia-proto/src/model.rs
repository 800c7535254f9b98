//! Core entities shared across the orchestration core: devices, workers,
//! handoff records, queued messages and the public cognitive state.
//!
//! Names and field shapes follow the data model directly; semantics are
//! binding where the design documents say so.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

// ─── Device & Worker ──────────────────────────────────────────────────────────

/// A single exclusive compute resource. At most one [`Worker`] owns a
/// `Device` at any instant — enforced by `GPUHandoffCoordinator`, not by
/// this type itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub total_mem_mb: u64,
    pub used_mem_mb: u64,
}

/// The two roles that can own a device, plus their pre-warmed candidate
/// variants used during a promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Prime,
    Study,
    PrimeCandidate,
    StudyCandidate,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prime => "prime",
            Self::Study => "study",
            Self::PrimeCandidate => "prime_candidate",
            Self::StudyCandidate => "study_candidate",
        };
        write!(f, "{s}")
    }
}

/// A unit that may own the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub kind: WorkerKind,
    /// Opaque handle into whatever `ContainerBackend` implementation is in
    /// use; the core never interprets it.
    pub container_handle: Option<String>,
    pub desired_running: bool,
    pub health: WorkerHealth,
    pub last_started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
}

impl Worker {
    pub fn new(name: impl Into<String>, kind: WorkerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            container_handle: None,
            desired_running: false,
            health: WorkerHealth::Unknown,
            last_started_at: None,
            restart_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

// ─── Handoff ──────────────────────────────────────────────────────────────────

/// Opaque unique token identifying one handoff attempt. Unique across the
/// process lifetime (wraps a v4 UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandoffId(pub Uuid);

impl HandoffId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandoffId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandoffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Phases of one handoff attempt, in the order they are entered. Failure
/// transitions (`Failed`, `Cancelled`, `TimedOut`) are reachable from any
/// non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffPhase {
    Requested,
    DrainingSource,
    WaitingRelease,
    StartingTarget,
    VerifyingHealth,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl HandoffPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Cancellation is refused once the coordinator has started verifying
    /// the target's health: the target is already starting, so best
    /// effort is to let it complete rather than tear it down.
    pub fn cancellable(&self) -> bool {
        !self.is_terminal() && !matches!(self, Self::VerifyingHealth)
    }

    pub fn result(&self) -> Option<HandoffResult> {
        match self {
            Self::Completed => Some(HandoffResult::Completed),
            Self::Failed => Some(HandoffResult::Failed),
            Self::Cancelled => Some(HandoffResult::Cancelled),
            Self::TimedOut => Some(HandoffResult::TimedOut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffResult {
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

/// The full audit record of one handoff attempt. `result` is derived from
/// `phase` (see [`HandoffPhase::result`]) rather than stored separately,
/// so the two can never disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub id: HandoffId,
    pub from_worker: String,
    pub to_worker: String,
    pub phase: HandoffPhase,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl HandoffRecord {
    pub fn new(
        from_worker: impl Into<String>,
        to_worker: impl Into<String>,
        reason: impl Into<String>,
        outer_deadline: Duration,
    ) -> Self {
        let requested_at = Utc::now();
        let deadline_at = requested_at
            + chrono::Duration::from_std(outer_deadline).unwrap_or(chrono::Duration::seconds(180));
        Self {
            id: HandoffId::new(),
            from_worker: from_worker.into(),
            to_worker: to_worker.into(),
            phase: HandoffPhase::Requested,
            reason: reason.into(),
            requested_at,
            deadline_at,
            completed_at: None,
        }
    }

    pub fn result(&self) -> Option<HandoffResult> {
        self.phase.result()
    }
}

// ─── Routing ──────────────────────────────────────────────────────────────────

/// A dialable network location for a logical role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(pub String);

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<S: Into<String>> From<S> for Endpoint {
    fn from(s: S) -> Self {
        Self(s.into())
    }
}

/// Aggregate HA status reported on the orchestrator's `/status` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaStatus {
    Active,
    Degraded,
    FailoverActive,
    Failed,
}

// ─── Message queue ────────────────────────────────────────────────────────────

/// An inbound user message held by the `MessageQueue` while its owning
/// cognition service is not ACTIVE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub session_id: String,
    pub content: String,
    pub source: String,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl QueuedMessage {
    pub fn new(session_id: impl Into<String>, content: impl Into<String>, source: impl Into<String>, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            content: content.into(),
            source: source.into(),
            priority,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

// ─── Cognitive lifecycle ──────────────────────────────────────────────────────

/// The six externally-observable states of one cognition service. Internal
/// transient phases inside `Asleep` (`_FINISHING_TASK`, `_WAKING`) are
/// deliberately not represented here — they are never externally
/// observable (see `gaia-sleep`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GaiaState {
    Active,
    Drowsy,
    Asleep,
    Dreaming,
    Distracted,
    Offline,
}

impl fmt::Display for GaiaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Drowsy => "drowsy",
            Self::Asleep => "asleep",
            Self::Dreaming => "dreaming",
            Self::Distracted => "distracted",
            Self::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handoff_phase_cancellable_window() {
        assert!(HandoffPhase::Requested.cancellable());
        assert!(HandoffPhase::DrainingSource.cancellable());
        assert!(HandoffPhase::WaitingRelease.cancellable());
        assert!(HandoffPhase::StartingTarget.cancellable());
        assert!(!HandoffPhase::VerifyingHealth.cancellable());
        assert!(!HandoffPhase::Completed.cancellable());
    }

    #[test]
    fn handoff_phase_result_only_for_terminal() {
        assert_eq!(HandoffPhase::Completed.result(), Some(HandoffResult::Completed));
        assert_eq!(HandoffPhase::Requested.result(), None);
    }

    #[test]
    fn handoff_record_deadline_defaults_to_outer() {
        let rec = HandoffRecord::new("prime", "study", "promotion", Duration::from_secs(180));
        assert!(rec.deadline_at > rec.requested_at);
        assert_eq!(rec.result(), None);
    }

    #[test]
    fn gaia_state_serializes_lowercase() {
        let json = serde_json::to_string(&GaiaState::Dreaming).unwrap();
        assert_eq!(json, "\"dreaming\"");
    }
}
