//! Error types for the httplimit crate.

use std::time::Duration;

use thiserror::Error;

/// Main error type for httplimit operations.
#[derive(Error, Debug)]
pub enum HttplimitError {
    /// Configuration-related errors. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A quota definition that cannot be enforced
    #[error("Invalid quota '{name}': {reason}")]
    InvalidQuota { name: String, reason: String },

    /// Two quotas with the same name on one limiter
    #[error("Duplicate quota name '{0}'")]
    DuplicateQuota(String),

    /// The counting backend failed while serving a request
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A shared store call did not complete in time
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store has already been closed
    #[error("Store is closed")]
    StoreClosed,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for HttplimitError {
    fn from(err: redis::RedisError) -> Self {
        HttplimitError::Backend(err.to_string())
    }
}

impl From<config::ConfigError> for HttplimitError {
    fn from(err: config::ConfigError) -> Self {
        HttplimitError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for HttplimitError {
    fn from(err: serde_yaml::Error) -> Self {
        HttplimitError::Config(err.to_string())
    }
}

/// Result type alias for httplimit operations.
pub type Result<T> = std::result::Result<T, HttplimitError>;
