//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.
//! Conditions that only need waiting (pod not running yet, secret missing)
//! are not errors: actors report them as a requeue directive instead.

use std::time::Duration;
use thiserror::Error;

use crate::client::parsing::ParseError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Command execution inside a pod failed
    #[error("Exec in pod {pod} failed: {message}")]
    Exec { pod: String, message: String },

    /// Command output did not have the expected shape
    #[error("Malformed command output: {0}")]
    Parse(#[from] ParseError),

    /// Optimistic concurrency retries ran out
    #[error("Update of {0} kept conflicting, giving up")]
    Conflict(String),

    /// Admin command reported a failure
    #[error("Admin command {op} failed: {message}")]
    Dispatch { op: String, message: String },

    /// Version transition not allowed
    #[error("Version error: {0}")]
    Version(String),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, conflicts and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Transient(_) | Error::Exec { .. } | Error::Conflict(_) => true,
            Error::Dispatch { .. } => true,
            Error::Validation(_) | Error::Permanent(_) | Error::MissingField(_) => false,
            Error::Serialization(_) | Error::Parse(_) | Error::Version(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(300)
        }
    }
}

/// Build a Kubernetes API error with the given status code.
///
/// Used by the in-memory cluster state so callers see the same errors the
/// API server would return.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    }))
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
