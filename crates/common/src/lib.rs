//! Resilience building blocks for fetching slow or flaky upstream data.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: error taxonomy and serde helpers
//! - `runtime`: async components (coalescing cache, circuit breaker, retry,
//!   backpressure queue, metrics registry)

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod utils;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod cache;
#[cfg(feature = "runtime")]
pub mod observability;
#[cfg(feature = "runtime")]
pub mod queue;
#[cfg(feature = "runtime")]
pub mod resilience;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "runtime")]
pub use cache::{CacheConfig, CacheStats, CoalescingCache};
#[cfg(feature = "foundation")]
pub use error::{
    ConfigError, ConfigResult, ErrorClassification, ErrorKind, ErrorSeverity, FetchError,
    FetchResult,
};
#[cfg(feature = "runtime")]
pub use observability::{MetricsRegistry, Snapshot};
#[cfg(feature = "runtime")]
pub use queue::{BackpressureQueue, QueueConfig, QueueMetrics, ShutdownMode, TaskHandle};
#[cfg(feature = "runtime")]
pub use resilience::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
    Clock, Jitter, KindRetryPolicy, MockClock, ResilienceError, ResilienceResult, RetryConfig,
    RetryDecision, RetryError, RetryExecutor, RetryPolicy, RetryResult, SystemClock,
};
#[cfg(feature = "foundation")]
pub use utils::duration_millis;
