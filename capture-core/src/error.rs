//! Error types for proxy operations

use std::path::PathBuf;
use thiserror::Error;

/// A required option is missing, empty or unparsable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Configuration error: option `{field}` {reason}")]
pub struct ConfigError {
    pub field: String,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for the most common case: a required option has no value.
    pub fn missing(field: &str) -> Self {
        Self::new(field, "must be set")
    }
}

/// Failures raised by an interceptor while handling a single flow.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterceptError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("Malformed payload: {reason}")]
    MalformedPayload { reason: String },

    #[error("Storage error at {}: {reason}", path.display())]
    Storage { path: PathBuf, reason: String },
}

impl InterceptError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Storage {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Configuration problems abort the whole run; everything else is
    /// recovered by letting the flow pass through untouched.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Main error type for proxy operations
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Fatal interception error: {0}")]
    Intercept(#[from] InterceptError),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream connection error: {0}")]
    UpstreamConnection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
