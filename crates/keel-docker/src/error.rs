//! Orchestrator error types.

use keel_core::ApiStatus;
use thiserror::Error;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to connect to orchestrator: {0}")]
    Connect(String),

    #[error("orchestrator request failed: {0}")]
    Request(String),

    /// Non-success response from the Engine API.
    #[error("orchestrator returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Stale service version or a conflicting operation already running.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    pub fn status(&self) -> ApiStatus {
        match self {
            OrchestratorError::NotFound(_) => ApiStatus::NotFound,
            _ => ApiStatus::Generic,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, OrchestratorError::Conflict(_))
    }
}
