//! Scheduler error types.

use keel_build::BuildError;
use keel_core::{ApiStatus, CoreError, DeployFailure};
use keel_docker::OrchestratorError;
use keel_proxy::ProxyError;
use keel_service::ServiceError;
use keel_state::StateError;
use thiserror::Error;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur during scheduling and app management.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{0}")]
    IllegalOperation(String),

    #[error("{0}")]
    IllegalParameter(String),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// Outcome of a deploy shared with other coalesced callers.
    #[error(transparent)]
    Deploy(#[from] DeployFailure),

    #[error("{0}")]
    Generic(String),
}

impl SchedulerError {
    pub fn status(&self) -> ApiStatus {
        match self {
            SchedulerError::IllegalOperation(_) => ApiStatus::IllegalOperation,
            SchedulerError::IllegalParameter(_) => ApiStatus::IllegalParameter,
            SchedulerError::Build(e) => e.status(),
            SchedulerError::Service(e) => e.status(),
            SchedulerError::Proxy(e) => e.status(),
            SchedulerError::State(e) => e.status(),
            SchedulerError::Orchestrator(e) => e.status(),
            SchedulerError::Core(e) => e.status(),
            SchedulerError::Deploy(f) => f.status,
            SchedulerError::Generic(_) => ApiStatus::Generic,
        }
    }

    /// Flatten into a failure that can be cloned to every waiting caller.
    pub fn to_failure(&self) -> DeployFailure {
        match self {
            SchedulerError::Deploy(f) => f.clone(),
            other => DeployFailure::new(other.status(), other.to_string()),
        }
    }
}
