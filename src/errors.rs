//! Error types for the log shim

use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShimError>;

#[derive(Debug, Error)]
pub enum ShimError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client could not be built
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Pipeline tuning is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Logger options could not be resolved into a destination config
    #[error("Invalid log option '{key}': {reason}")]
    Option { key: String, reason: String },

    /// The container output stream failed while reading
    #[error("Upstream {source_name} failed: {error}")]
    Upstream {
        source_name: &'static str,
        #[source]
        error: std::io::Error,
    },

    /// The pipeline was asked to move between incompatible states
    #[error("Invalid state transition: {0}")]
    State(String),

    /// A pipeline task panicked or was cancelled by the runtime
    #[error("Task error: {0}")]
    Task(String),
}

impl ShimError {
    pub(crate) fn option(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ShimError::Option {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Whether a failed publish may succeed if tried again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Throttling, timeouts, connection resets, server-side errors
    Retryable,
    /// Malformed request, authorization failure, payload too large
    Terminal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Retryable => write!(f, "retryable"),
            ErrorKind::Terminal => write!(f, "terminal"),
        }
    }
}

/// Failure reported by a destination, for a whole batch or a single record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} publish error: {message}")]
pub struct PublishError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PublishError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Terminal,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Retryable
    }
}
