//! Shared data model and collaborator contracts for the GAIA orchestration
//! and lifecycle core.
//!
//! Every other `gaia-*` crate depends on this one for the entities that
//! cross component boundaries (workers, devices, handoff records, health
//! snapshots, queued messages, the public cognitive state) and for the
//! two external-collaborator traits the core is driven through:
//! [`ContainerBackend`] and [`HealthProbe`].

#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod error;
pub mod health;
pub mod model;

pub use backend::{ContainerBackend, InMemoryContainerBackend, WorkerRunState, WorkerStatus};
pub use error::{ProtoError, ProtoResult};
pub use health::{HealthProbe, HealthSnapshot, ScriptedHealthProbe};
pub use model::{
    Device, Endpoint, GaiaState, HandoffId, HandoffPhase, HandoffRecord, HandoffResult,
    QueuedMessage, Worker, WorkerKind,
};
