//! Numeric API status codes shared by every keel error type.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status code attached to every failure surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiStatus {
    Generic,
    AlreadyExists,
    BadName,
    IllegalOperation,
    BuildError,
    IllegalParameter,
    NotFound,
    AuthenticationFailed,
}

impl ApiStatus {
    pub fn code(self) -> u16 {
        match self {
            ApiStatus::Generic => 1000,
            ApiStatus::AlreadyExists => 1103,
            ApiStatus::BadName => 1104,
            ApiStatus::IllegalOperation => 1108,
            ApiStatus::BuildError => 1109,
            ApiStatus::IllegalParameter => 1110,
            ApiStatus::NotFound => 1111,
            ApiStatus::AuthenticationFailed => 1112,
        }
    }
}

impl fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A deploy failure that can be handed to several waiting callers.
///
/// Coalesced deploy requests share one outcome, so the failure has to be
/// `Clone`; the originating error is flattened to its status and message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{status}] {message}")]
pub struct DeployFailure {
    pub status: ApiStatus,
    pub message: String,
}

impl DeployFailure {
    pub fn new(status: ApiStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(ApiStatus::Generic.code(), 1000);
        assert_eq!(ApiStatus::IllegalOperation.code(), 1108);
        assert_eq!(ApiStatus::AuthenticationFailed.code(), 1112);
    }

    #[test]
    fn test_failure_display() {
        let f = DeployFailure::new(ApiStatus::BuildError, "boom");
        assert_eq!(f.to_string(), "[1109] boom");
    }
}
