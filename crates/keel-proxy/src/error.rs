//! Load balancer error types.

use keel_core::{ApiStatus, DeployFailure};
use keel_docker::OrchestratorError;
use keel_state::StateError;
use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("template error: {0}")]
    Template(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// A regeneration pass failed; shared by every caller batched into it.
    #[error(transparent)]
    Pass(DeployFailure),

    #[error("{0}")]
    Generic(String),
}

impl ProxyError {
    pub fn status(&self) -> ApiStatus {
        match self {
            ProxyError::State(e) => e.status(),
            ProxyError::Orchestrator(e) => e.status(),
            ProxyError::Pass(f) => f.status,
            _ => ApiStatus::Generic,
        }
    }

    pub(crate) fn to_failure(&self) -> DeployFailure {
        match self {
            ProxyError::Pass(f) => f.clone(),
            other => DeployFailure::new(other.status(), other.to_string()),
        }
    }
}

impl From<tera::Error> for ProxyError {
    fn from(e: tera::Error) -> Self {
        // tera keeps the useful part in the source chain
        let mut message = e.to_string();
        let mut source = std::error::Error::source(&e);
        while let Some(inner) = source {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            source = inner.source();
        }
        ProxyError::Template(message)
    }
}
