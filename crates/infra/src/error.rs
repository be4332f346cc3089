//! Infrastructure error type
//!
//! Component-level failures stay [`FetchError`](fetchguard_common::FetchError);
//! this type covers process setup: reading config files, parsing them,
//! validating the result, and installing the tracing subscriber.

use std::io;
use std::path::PathBuf;

use fetchguard_common::error::ConfigError;
use thiserror::Error;

/// Errors raised while setting up fetchguard in a process
#[derive(Debug, Error)]
pub enum InfraError {
    /// Missing or invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Config file could not be read
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Config file contents could not be parsed
    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// Tracing subscriber could not be installed
    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl From<ConfigError> for InfraError {
    fn from(err: ConfigError) -> Self {
        InfraError::Config(err.to_string())
    }
}

/// Result type for infrastructure setup
pub type InfraResult<T> = Result<T, InfraError>;
