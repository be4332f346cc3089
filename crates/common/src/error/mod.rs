//! Tagged error taxonomy shared by the cache and resilience layers
//!
//! Every failure that crosses a component boundary is described by an
//! [`ErrorKind`]. Retry, breaker and queue decisions are taken by inspecting
//! that tag rather than by matching on concrete error types.
//!
//! # Error Kinds
//!
//! | Kind | Retryable by default | Raised by |
//! |------|----------------------|-----------|
//! | **Upstream** | yes | the fetch operation (transient upstream failure) |
//! | **RateLimit** | yes, with a cooldown floor | the fetch operation |
//! | **Timeout** | yes | the fetch operation or a caller deadline |
//! | **CircuitOpen** | no | `CircuitBreaker` while open |
//! | **QueueFull** | no | `BackpressureQueue` admission |
//! | **NonRetryable** | no | the fetch operation (bad request, parse error, ...) |
//! | **Cancelled** | no | a caller-side cancellation token |
//! | **ShutDown** | no | `BackpressureQueue` after shutdown |
//!
//! # Classification
//!
//! Error types participate in retry decisions by implementing
//! [`ErrorClassification`]. [`FetchError`] implements it directly; wrapping
//! error types can delegate to the error they carry.
//!
//! ```
//! use std::time::Duration;
//!
//! use fetchguard_common::error::{ErrorClassification, ErrorKind, FetchError};
//!
//! let err = FetchError::rate_limited("429 from quote endpoint", Some(Duration::from_secs(2)));
//! assert_eq!(err.kind(), ErrorKind::RateLimit);
//! assert!(err.is_retryable());
//! assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Standard result type using [`FetchError`]
pub type FetchResult<T> = Result<T, FetchError>;

/// Discriminant carried by every [`FetchError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient upstream failure (connection reset, 5xx, ...)
    Upstream,
    /// Upstream rejected the call because of a rate limit
    RateLimit,
    /// The operation or a caller deadline timed out
    Timeout,
    /// The circuit breaker short-circuited the call
    CircuitOpen,
    /// The backpressure queue rejected the submission
    QueueFull,
    /// Permanent failure that must surface on first occurrence
    NonRetryable,
    /// The caller abandoned its wait
    Cancelled,
    /// The component was shut down before the work ran
    ShutDown,
}

impl ErrorKind {
    /// Stable snake_case label, used as a metrics key
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::QueueFull => "queue_full",
            Self::NonRetryable => "non_retryable",
            Self::Cancelled => "cancelled",
            Self::ShutDown => "shut_down",
        }
    }

    /// Kinds retried by the default retry policy
    pub fn default_retryable() -> &'static [ErrorKind] {
        &[Self::Upstream, Self::RateLimit, Self::Timeout]
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by fetch operations and by every fetchguard component
///
/// Cloneable so a single failed fetch can be handed to every caller that was
/// coalesced onto it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct FetchError {
    kind: ErrorKind,
    message: String,
    retry_after: Option<Duration>,
}

impl FetchError {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retry_after: None }
    }

    /// Transient upstream failure
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, message)
    }

    /// Rate-limit rejection, optionally carrying the upstream's retry hint
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self { kind: ErrorKind::RateLimit, message: message.into(), retry_after }
    }

    /// Operation timeout
    pub fn timeout(operation: &str, duration: Duration) -> Self {
        Self::new(ErrorKind::Timeout, format!("{operation} timed out after {duration:?}"))
    }

    /// Circuit breaker rejection
    pub fn circuit_open(retry_after: Option<Duration>) -> Self {
        Self {
            kind: ErrorKind::CircuitOpen,
            message: "circuit breaker is open, rejecting calls".to_string(),
            retry_after,
        }
    }

    /// Backpressure rejection
    pub fn queue_full(capacity: usize) -> Self {
        Self::new(
            ErrorKind::QueueFull,
            format!("queue full ({capacity} tasks admitted), request dropped"),
        )
    }

    /// Permanent failure
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NonRetryable, message)
    }

    /// Caller-side cancellation
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Work rejected or aborted by a shutdown
    pub fn shut_down(component: &str) -> Self {
        Self::new(ErrorKind::ShutDown, format!("{component} has been shut down"))
    }

    /// Attach a retry hint
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// The error tag
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable detail
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Classification interface consulted by retry policies and metrics
pub trait ErrorClassification {
    /// The tag describing this error
    fn kind(&self) -> ErrorKind;

    /// Whether the default policy would retry this error
    fn is_retryable(&self) -> bool {
        ErrorKind::default_retryable().contains(&self.kind())
    }

    /// Suggested delay before the next attempt, if the source provided one
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Severity for logging and alerting
    fn severity(&self) -> ErrorSeverity {
        match self.kind() {
            ErrorKind::Cancelled => ErrorSeverity::Info,
            ErrorKind::RateLimit
            | ErrorKind::Timeout
            | ErrorKind::Upstream
            | ErrorKind::QueueFull
            | ErrorKind::CircuitOpen => ErrorSeverity::Warning,
            ErrorKind::NonRetryable | ErrorKind::ShutDown => ErrorSeverity::Error,
        }
    }
}

impl ErrorClassification for FetchError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Configuration validation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;
