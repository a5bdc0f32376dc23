//! Error types for the counting engine and its storage backends.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single backend call
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("HTTP request to remote store failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote store returned an error: {0}")]
    Remote(String),

    #[error("Unexpected reply from remote store: {0}")]
    Protocol(String),

    #[error("Local store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize local store state: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Local store task failed: {0}")]
    Task(String),
}

/// Errors surfaced to callers of the counting engine
#[derive(Error, Debug)]
pub enum CounterError {
    #[error("Invalid counter key: {0}")]
    InvalidKey(String),

    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    #[error("Backend call {operation} timed out after {after:?}")]
    BackendTimeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Backend unavailable for {operation}: {reason}")]
    BackendUnavailable {
        operation: &'static str,
        reason: String,
    },
}

impl CounterError {
    /// True for errors caused by caller input rather than the backend
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            CounterError::InvalidKey(_)
                | CounterError::InvalidFingerprint(_)
                | CounterError::InvalidUserId(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_errors_are_classified() {
        assert!(CounterError::InvalidKey("".into()).is_invalid_input());
        assert!(CounterError::InvalidFingerprint("".into()).is_invalid_input());
        assert!(!CounterError::BackendUnavailable {
            operation: "total",
            reason: "down".into(),
        }
        .is_invalid_input());
    }

    #[test]
    fn test_timeout_message_names_operation() {
        let err = CounterError::BackendTimeout {
            operation: "register_hit",
            after: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("register_hit"));
        assert!(err.to_string().contains("5s"));
    }
}
