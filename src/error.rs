//! Error types for elohim-duplex

use std::time::Duration;

use thiserror::Error;

use crate::protocol::ApiError;
use crate::transport::TransportError;

/// Result type for duplex client operations
pub type Result<T> = std::result::Result<T, DuplexError>;

#[derive(Error, Debug)]
pub enum DuplexError {
    /// The retry budget was exhausted while dialing.
    #[error("Unable to connect after {attempts} attempt(s): {source}")]
    DialFailure {
        attempts: u32,
        #[source]
        source: Box<DuplexError>,
    },

    #[error("Cannot communicate: {0}")]
    CannotCommunicate(String),

    /// The operation was attempted after the connection was stopped.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    /// The remote API answered with a non-success status.
    #[error("Application error (status {status_code}): {}", summarize(.errors))]
    Application {
        status_code: u16,
        errors: Vec<ApiError>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Request {0} is already awaiting a response")]
    DuplicateRequest(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DuplexError {
    /// Status code of an application error, if this is one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DuplexError::Application { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

fn summarize(errors: &[ApiError]) -> String {
    if errors.is_empty() {
        return "no details".to_string();
    }
    errors
        .iter()
        .map(|e| format!("{}: {}", e.title, e.description))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_error_display_joins_titles() {
        let err = DuplexError::Application {
            status_code: 422,
            errors: vec![
                ApiError::new(422, "Validation Error", "name is required"),
                ApiError::new(422, "Validation Error", "port out of range"),
            ],
        };

        assert_eq!(err.status_code(), Some(422));
        assert_eq!(
            err.to_string(),
            "Application error (status 422): Validation Error: name is required; Validation Error: port out of range"
        );
    }

    #[test]
    fn test_dial_failure_keeps_last_error() {
        let err = DuplexError::DialFailure {
            attempts: 3,
            source: Box::new(DuplexError::CannotCommunicate("refused".into())),
        };

        assert!(err.to_string().starts_with("Unable to connect after 3 attempt(s)"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Cannot communicate: refused"));
    }
}
