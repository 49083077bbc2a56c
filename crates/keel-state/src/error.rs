//! Error types for the keel state store.

use keel_core::{ApiStatus, CoreError};
use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    /// A record failed save-time validation.
    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    IllegalOperation(String),

    #[error("{0}")]
    IllegalParameter(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl StateError {
    pub fn status(&self) -> ApiStatus {
        match self {
            StateError::NotFound(_) => ApiStatus::NotFound,
            StateError::AlreadyExists(_) => ApiStatus::AlreadyExists,
            StateError::IllegalOperation(_) => ApiStatus::IllegalOperation,
            StateError::IllegalParameter(_) => ApiStatus::IllegalParameter,
            StateError::Core(e) => e.status(),
            _ => ApiStatus::Generic,
        }
    }
}
