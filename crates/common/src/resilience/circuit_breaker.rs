//! Circuit breaker guarding a single upstream dependency
//!
//! State machine:
//!
//! ```text
//!   Closed --(failure_threshold consecutive failures)--> Open
//!   Open   --(recovery_timeout elapsed, next call admitted)--> HalfOpen
//!   HalfOpen --(expected_successes consecutive successes)--> Closed
//!   HalfOpen --(any failure)--> Open
//! ```
//!
//! The half-open policy is deliberately asymmetric: a single failed trial
//! reopens the circuit, while closing it again takes `expected_successes`
//! consecutive successes.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, FetchError};

/// Errors produced by breaker-protected calls
///
/// Generic over the wrapped operation's error type so the original failure is
/// preserved as the error source.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open, rejecting calls
    #[error("Circuit breaker is open, rejecting calls")]
    CircuitOpen {
        /// Time remaining until the breaker admits a trial call
        retry_after: Option<Duration>,
    },

    /// The underlying operation failed
    #[error("Operation failed: {source}")]
    OperationFailed {
        #[source]
        source: E,
    },
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether the breaker rejected the call without running it
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// The operation's own error, if the operation ran
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::OperationFailed { source } => Some(source),
            Self::CircuitOpen { .. } => None,
        }
    }
}

impl From<ResilienceError<FetchError>> for FetchError {
    fn from(err: ResilienceError<FetchError>) -> Self {
        match err {
            ResilienceError::CircuitOpen { retry_after } => FetchError::circuit_open(retry_after),
            ResilienceError::OperationFailed { source } => source,
        }
    }
}

/// Result type for breaker-protected operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, admitting trial requests
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before opening the circuit
    pub failure_threshold: u64,
    /// Consecutive half-open successes needed to close the circuit
    pub expected_successes: u64,
    /// Time after the last failure before a trial call is admitted
    pub recovery_timeout: Duration,
    /// Whether a success in Closed resets the consecutive failure count
    pub reset_on_success: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            expected_successes: 10,
            recovery_timeout: Duration::from_secs(60),
            reset_on_success: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }

        if self.expected_successes == 0 {
            return Err(ConfigError::invalid("expected_successes must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn expected_successes(mut self, successes: u64) -> Self {
        self.config.expected_successes = successes;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    pub fn reset_on_success(mut self, reset: bool) -> Self {
        self.config.reset_on_success = reset;
        self
    }

    /// Set a custom clock and build a breaker directly (useful for testing)
    pub fn clock<C: Clock>(self, clock: C) -> CircuitBreakerBuilderWithClock<C> {
        CircuitBreakerBuilderWithClock { config: self.config, clock }
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Builder with custom clock that builds a CircuitBreaker directly
pub struct CircuitBreakerBuilderWithClock<C: Clock> {
    config: CircuitBreakerConfig,
    clock: C,
}

impl<C: Clock> CircuitBreakerBuilderWithClock<C> {
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn expected_successes(mut self, successes: u64) -> Self {
        self.config.expected_successes = successes;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreaker<C>> {
        CircuitBreaker::with_clock(self.config, self.clock)
    }
}

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub half_open_successes: u64,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub last_failure_time: Option<Instant>,
    pub state_change_time: Instant,
}

/// Mutable breaker state, only touched under the breaker's own lock
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u64,
    half_open_successes: u64,
    last_failure_time: Option<Instant>,
    state_change_time: Instant,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.state_change_time = now;
    }
}

/// Circuit breaker for one upstream dependency
///
/// Clones share state, so one breaker can be handed to every call site that
/// talks to the same upstream.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    rejected_calls: Arc<AtomicU64>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &state.state)
            .field("consecutive_failures", &state.consecutive_failures)
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            total_calls: Arc::clone(&self.total_calls),
            total_successes: Arc::clone(&self.total_successes),
            total_failures: Arc::clone(&self.total_failures),
            rejected_calls: Arc::clone(&self.rejected_calls),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker using the system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a circuit breaker using the builder pattern
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;

        let now = clock.now();
        Ok(Self {
            config,
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                last_failure_time: None,
                state_change_time: now,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            rejected_calls: Arc::new(AtomicU64::new(0)),
            clock: Arc::new(clock),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Circuit breaker state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Decide whether a call may run, moving Open to HalfOpen once the
    /// recovery timeout has elapsed. On rejection returns the remaining wait.
    fn admit(&self) -> Result<(), Option<Duration>> {
        let now = self.clock.now();
        let mut state = self.lock_state();

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let since_failure =
                    state.last_failure_time.map(|t| now.saturating_duration_since(t));
                match since_failure {
                    Some(elapsed) if elapsed < self.config.recovery_timeout => {
                        Err(Some(self.config.recovery_timeout - elapsed))
                    }
                    _ => {
                        state.transition(CircuitState::HalfOpen, now);
                        state.half_open_successes = 0;
                        info!("Circuit breaker transitioning to HALF_OPEN");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Check if the circuit breaker allows execution
    ///
    /// Returns `false` while open and inside the recovery timeout. Once the
    /// timeout has elapsed this transitions the breaker to half-open and
    /// returns `true`.
    pub fn can_execute(&self) -> bool {
        self.admit().is_ok()
    }

    /// Execute an async operation with circuit breaker protection
    ///
    /// While open the operation is never invoked and
    /// [`ResilienceError::CircuitOpen`] is returned immediately.
    #[instrument(skip(self, operation), fields(state = %self.state()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Err(retry_after) = self.admit() {
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
            debug!("Circuit breaker rejecting call");
            return Err(ResilienceError::CircuitOpen { retry_after });
        }

        self.total_calls.fetch_add(1, Ordering::Relaxed);

        match operation().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(error) => {
                self.record_failure();
                debug!(error = %error, "Circuit breaker: operation failed");
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Execute a synchronous operation with circuit breaker protection
    pub fn call<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Err(retry_after) = self.admit() {
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
            return Err(ResilienceError::CircuitOpen { retry_after });
        }

        self.total_calls.fetch_add(1, Ordering::Relaxed);

        match operation() {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(error) => {
                self.record_failure();
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let mut state = self.lock_state();

        match state.state {
            CircuitState::Closed => {
                if self.config.reset_on_success {
                    state.consecutive_failures = 0;
                }
            }
            CircuitState::HalfOpen => {
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.expected_successes {
                    let successes = state.half_open_successes;
                    state.transition(CircuitState::Closed, now);
                    state.consecutive_failures = 0;
                    state.half_open_successes = 0;
                    info!(successes, "Circuit breaker closed after half-open successes");
                }
            }
            CircuitState::Open => {
                // A call admitted before a concurrent failure reopened the circuit.
                debug!("Success recorded while circuit is open");
            }
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let mut state = self.lock_state();

        state.consecutive_failures += 1;
        state.last_failure_time = Some(now);

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.transition(CircuitState::Open, now);
                    warn!(
                        failures = state.consecutive_failures,
                        "Circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.transition(CircuitState::Open, now);
                state.half_open_successes = 0;
                warn!("Circuit breaker reopened due to failure in half-open state");
            }
            CircuitState::Open => {}
        }
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.lock_state().state
    }

    /// Remaining time before an open breaker admits a trial call
    pub fn retry_after(&self) -> Option<Duration> {
        let state = self.lock_state();
        if state.state != CircuitState::Open {
            return None;
        }
        let elapsed = state.last_failure_time.map(|t| self.clock.now().saturating_duration_since(t));
        elapsed.map(|e| self.config.recovery_timeout.saturating_sub(e))
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.lock_state();
        CircuitBreakerMetrics {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            half_open_successes: state.half_open_successes,
            total_calls: self.total_calls.load(Ordering::Acquire),
            total_successes: self.total_successes.load(Ordering::Acquire),
            total_failures: self.total_failures.load(Ordering::Acquire),
            rejected_calls: self.rejected_calls.load(Ordering::Acquire),
            last_failure_time: state.last_failure_time,
            state_change_time: state.state_change_time,
        }
    }

    /// The breaker's configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut state = self.lock_state();
        state.transition(CircuitState::Closed, now);
        state.consecutive_failures = 0;
        state.half_open_successes = 0;
        state.last_failure_time = None;
        info!("Circuit breaker manually reset to closed state");
    }

    #[cfg(test)]
    fn force_state(&self, to: CircuitState) {
        let now = self.clock.now();
        self.lock_state().transition(to, now);
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        Self {
            config: CircuitBreakerConfig::default(),
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                last_failure_time: None,
                state_change_time: Instant::now(),
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            rejected_calls: Arc::new(AtomicU64::new(0)),
            clock: Arc::new(SystemClock),
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the circuit breaker state machine
    //!
    //! Tests cover configuration validation, threshold transitions, lazy
    //! half-open admission, the asymmetric half-open policy and metrics.

    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::resilience::MockClock;

    fn breaker(clock: &MockClock, threshold: u64, successes: u64) -> CircuitBreaker<MockClock> {
        CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .expected_successes(successes)
            .recovery_timeout(Duration::from_secs(60))
            .clock(clock.clone())
            .build()
            .unwrap()
    }

    fn fail() -> Result<(), FetchError> {
        Err(FetchError::upstream("boom"))
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }

    #[test]
    fn test_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.expected_successes, 10);
        assert_eq!(config.recovery_timeout, Duration::from_secs(60));
        assert!(config.reset_on_success);
    }

    #[test]
    fn test_config_validation() {
        let mut config = CircuitBreakerConfig::default();
        assert!(config.validate().is_ok());

        config.failure_threshold = 0;
        assert!(config.validate().is_err());

        config.failure_threshold = 5;
        config.expected_successes = 0;
        assert!(config.validate().is_err());

        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
    }

    #[test]
    fn test_opens_after_threshold() {
        let clock = MockClock::new();
        let cb = breaker(&clock, 3, 1);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed, "Should remain closed below threshold");

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open, "Should open at threshold");
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_success_in_closed_resets_failures() {
        let clock = MockClock::new();
        let cb = breaker(&clock, 3, 1);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().consecutive_failures, 2);
    }

    #[test]
    fn test_open_rejects_without_invoking() {
        let clock = MockClock::new();
        let cb = breaker(&clock, 1, 1);
        let _ = cb.call(fail);

        let invoked = AtomicU32::new(0);
        let result: ResilienceResult<(), FetchError> = cb.call(|| {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.metrics().rejected_calls, 1);
    }

    #[test]
    fn test_first_call_after_timeout_executes() {
        let clock = MockClock::new();
        let cb = breaker(&clock, 2, 3);
        let _ = cb.call(fail);
        let _ = cb.call(fail);
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(61));

        let invoked = AtomicU32::new(0);
        let result: ResilienceResult<u32, FetchError> = cb.call(|| {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        });

        assert_eq!(result.unwrap(), 7);
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_single_failure_reopens() {
        let clock = MockClock::new();
        let cb = breaker(&clock, 2, 3);
        let _ = cb.call(fail);
        let _ = cb.call(fail);
        clock.advance(Duration::from_secs(61));

        let _ = cb.call(|| Ok::<_, FetchError>(()));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = cb.call(fail);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute(), "Reopened breaker waits a fresh recovery timeout");
    }

    #[test]
    fn test_half_open_closes_after_expected_successes() {
        let clock = MockClock::new();
        let cb = breaker(&clock, 1, 3);
        let _ = cb.call(fail);
        clock.advance(Duration::from_secs(61));

        for _ in 0..2 {
            let _ = cb.call(|| Ok::<_, FetchError>(()));
            assert_eq!(cb.state(), CircuitState::HalfOpen);
        }

        let _ = cb.call(|| Ok::<_, FetchError>(()));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().consecutive_failures, 0);
    }

    #[test]
    fn test_half_open_forced_closes_on_success() {
        let clock = MockClock::new();
        let cb = breaker(&clock, 5, 2);
        cb.force_state(CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_retry_after_counts_down() {
        let clock = MockClock::new();
        let cb = breaker(&clock, 1, 1);
        assert_eq!(cb.retry_after(), None);

        cb.record_failure();
        clock.advance(Duration::from_secs(20));

        assert_eq!(cb.retry_after(), Some(Duration::from_secs(40)));
    }

    #[test]
    fn test_reset() {
        let clock = MockClock::new();
        let cb = breaker(&clock, 1, 1);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.metrics().last_failure_time.is_none());
        assert!(cb.can_execute());
    }

    #[test]
    fn test_into_fetch_error() {
        let open: ResilienceError<FetchError> =
            ResilienceError::CircuitOpen { retry_after: Some(Duration::from_secs(1)) };
        let err: FetchError = open.into();
        assert_eq!(err.kind(), crate::error::ErrorKind::CircuitOpen);

        let failed = ResilienceError::OperationFailed { source: FetchError::upstream("x") };
        let err: FetchError = failed.into();
        assert_eq!(err, FetchError::upstream("x"));
    }

    #[tokio::test]
    async fn test_async_execute_records_outcomes() {
        let clock = MockClock::new();
        let cb = breaker(&clock, 2, 1);

        let ok = cb.execute(|| async { Ok::<_, FetchError>(1) }).await;
        assert_eq!(ok.unwrap(), 1);

        let _ = cb.execute(|| async { Err::<(), _>(FetchError::upstream("a")) }).await;
        let _ = cb.execute(|| async { Err::<(), _>(FetchError::upstream("b")) }).await;

        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.total_calls, 3);
        assert_eq!(metrics.total_successes, 1);
        assert_eq!(metrics.total_failures, 2);
    }

    #[test]
    fn test_clones_share_state() {
        let clock = MockClock::new();
        let cb = breaker(&clock, 1, 1);
        let other = cb.clone();

        other.record_failure();

        assert_eq!(cb.state(), CircuitState::Open);
    }
}
