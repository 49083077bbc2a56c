//! Image build error types.

use keel_core::{ApiStatus, CoreError};
use keel_docker::OrchestratorError;
use keel_state::StateError;
use thiserror::Error;

pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Missing, malformed or conflicting definition file.
    #[error("{0}")]
    Definition(String),

    /// The image build itself failed.
    #[error("{0}")]
    Build(String),

    #[error("{0}")]
    Pull(String),

    #[error("{0}")]
    Push(String),

    #[error("{0}")]
    Git(String),

    #[error("{0}")]
    AuthenticationFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("{0}")]
    Generic(String),
}

impl BuildError {
    pub fn status(&self) -> ApiStatus {
        match self {
            BuildError::Build(_) => ApiStatus::BuildError,
            BuildError::AuthenticationFailed(_) => ApiStatus::AuthenticationFailed,
            BuildError::State(e) => e.status(),
            BuildError::Orchestrator(e) => e.status(),
            BuildError::Core(e) => e.status(),
            _ => ApiStatus::Generic,
        }
    }
}
