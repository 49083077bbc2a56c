//! Error types for keel core validation.

use thiserror::Error;

use crate::status::ApiStatus;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    BadName(String),

    #[error("Domain name is not accepted. {0}")]
    InvalidDomain(String),

    #[error("Update order {0} is not supported")]
    InvalidUpdateOrder(String),

    #[error("{0}")]
    IllegalParameter(String),

    #[error("{0}")]
    Generic(String),
}

impl CoreError {
    pub fn status(&self) -> ApiStatus {
        match self {
            CoreError::BadName(_) | CoreError::InvalidDomain(_) => ApiStatus::BadName,
            CoreError::InvalidUpdateOrder(_) | CoreError::IllegalParameter(_) => {
                ApiStatus::IllegalParameter
            }
            CoreError::Generic(_) => ApiStatus::Generic,
        }
    }
}
