//! Shared error taxonomy.
//!
//! Mirrors the error kinds of the orchestration core's error-handling
//! design: contract violations are returned as structured refusals and
//! are never retried; transient I/O and fatal configuration get their
//! own variants so callers can match on kind rather than parse strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ProtoResult<T> = Result<T, ProtoError>;
