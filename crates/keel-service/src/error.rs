//! Service reconciler error types.

use keel_core::{ApiStatus, CoreError};
use keel_docker::OrchestratorError;
use keel_proxy::ProxyError;
use keel_state::StateError;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    IllegalParameter(String),

    #[error("{0}")]
    IllegalOperation(String),

    /// The service changed since its spec was read.
    #[error("service version conflict: {0}")]
    VersionConflict(String),

    #[error("pre-deploy hook failed: {0}")]
    Hook(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Orchestrator(OrchestratorError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("{0}")]
    Generic(String),
}

impl From<OrchestratorError> for ServiceError {
    fn from(e: OrchestratorError) -> Self {
        if e.is_conflict() {
            ServiceError::VersionConflict(e.to_string())
        } else {
            ServiceError::Orchestrator(e)
        }
    }
}

impl ServiceError {
    pub fn status(&self) -> ApiStatus {
        match self {
            ServiceError::IllegalParameter(_) => ApiStatus::IllegalParameter,
            ServiceError::IllegalOperation(_) | ServiceError::VersionConflict(_) => {
                ApiStatus::IllegalOperation
            }
            ServiceError::State(e) => e.status(),
            ServiceError::Orchestrator(e) => e.status(),
            ServiceError::Core(e) => e.status(),
            ServiceError::Proxy(e) => e.status(),
            _ => ApiStatus::Generic,
        }
    }
}
