//! Resilience patterns for upstream calls
//!
//! - **Circuit Breaker**: stops calling an upstream that keeps failing and
//!   probes it again after a recovery timeout
//! - **Retry Logic**: exponential backoff with proportional jitter, driven by
//!   [`ErrorKind`](crate::error::ErrorKind) classification
//!
//! Both components are generic over the operation's error type and compose
//! explicitly at the call site:
//!
//! ```no_run
//! use fetchguard_common::error::FetchError;
//! use fetchguard_common::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryExecutor};
//!
//! # async fn fetch_quote() -> Result<f64, FetchError> { Ok(100.0) }
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default())?;
//! let retry = RetryExecutor::default();
//!
//! let price = retry
//!     .execute(|| async { breaker.execute(fetch_quote).await.map_err(FetchError::from) })
//!     .await
//!     .map_err(FetchError::from)?;
//! # let _ = price;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerBuilderWithClock, CircuitBreakerConfig,
    CircuitBreakerConfigBuilder, CircuitBreakerMetrics, CircuitState, ResilienceError,
    ResilienceResult,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use retry::{
    policies, BackoffStrategy, Jitter, KindRetryPolicy, RetryConfig, RetryConfigBuilder,
    RetryDecision, RetryError, RetryExecutor, RetryOutcome, RetryPolicy, RetryResult, RetryStats,
};
