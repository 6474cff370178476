use std::time::Duration;

use thiserror::Error;

/// Failures on the request path. Everything except `Validation` is reported
/// to HTTP callers as a 500 with the display text as details.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    #[error("{0}")]
    Configuration(String),

    #[error("Session is not authorized: {0}")]
    Authorization(String),

    #[error("{message}")]
    Validation {
        message: String,
        details: Option<String>,
    },

    #[error("Could not connect: {0}")]
    Connect(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Client worker is not running")]
    Unavailable,
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn validation_with(message: impl Into<String>, details: impl Into<String>) -> Self {
        ServiceError::Validation {
            message: message.into(),
            details: Some(details.into()),
        }
    }
}
