//! Error types for kakunin.
//!
//! The domain variants surface to callers as distinguishable errors.
//! `Adapter` is internal: the orchestrator absorbs adapter failures into
//! domain-level outcomes and never returns this variant raw.

use thiserror::Error;

use crate::model::session::SessionStatus;
use crate::model::template::StepId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("step mismatch: session expects {expected:?}, client submitted {submitted}")]
    StepMismatch {
        expected: Option<StepId>,
        submitted: StepId,
    },

    #[error("worker {worker_id} already has an active session: {session_id}")]
    ActiveSessionExists {
        worker_id: uuid::Uuid,
        session_id: uuid::Uuid,
    },

    /// External adapter failure. Never crosses the orchestrator boundary.
    #[error("adapter failure ({adapter}): {message}")]
    Adapter {
        adapter: &'static str,
        message: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
