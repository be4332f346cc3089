//! Retry executor with exponential backoff and proportional jitter
//!
//! `max_attempts` counts total attempts, the first call included. The delay
//! before retry `n` (n >= 1) is `min(base * multiplier^(n-1), max_delay)` plus
//! uniform jitter of up to 10% of that delay. Rate-limit errors wait at least
//! the configured floor. Errors outside the policy's allow-list surface on
//! their first occurrence, and when attempts run out the last error is
//! returned as the source of [`RetryError::AttemptsExhausted`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ConfigResult, ErrorClassification, ErrorKind, FetchError};
use crate::observability::MetricsRegistry;

/// Errors that can occur during retry operations
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// All retry attempts have been exhausted
    #[error("All retry attempts exhausted after {attempts} tries: {source}")]
    AttemptsExhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The operation failed with a non-retryable error
    #[error("Operation failed with non-retryable error: {source}")]
    NonRetryable {
        #[source]
        source: E,
    },

    /// The next backoff would overrun the total time budget
    #[error("Retry timeout exceeded after {elapsed:?}: {source}")]
    TimeoutExceeded {
        elapsed: Duration,
        #[source]
        source: E,
    },

    /// The caller cancelled the retry loop
    #[error("Retry cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The last error returned by the operation, if any attempt completed
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::AttemptsExhausted { source, .. }
            | Self::NonRetryable { source }
            | Self::TimeoutExceeded { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }

    /// Consume the error, returning the operation's last error
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::AttemptsExhausted { source, .. }
            | Self::NonRetryable { source }
            | Self::TimeoutExceeded { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }
}

impl From<RetryError<FetchError>> for FetchError {
    fn from(err: RetryError<FetchError>) -> Self {
        match err {
            RetryError::AttemptsExhausted { source, .. } | RetryError::NonRetryable { source } => {
                source
            }
            RetryError::TimeoutExceeded { elapsed, source } => FetchError::new(
                ErrorKind::Timeout,
                format!("retry budget of {elapsed:?} exhausted, last error: {source}"),
            ),
            RetryError::Cancelled { attempts } => {
                FetchError::cancelled(format!("retry cancelled after {attempts} attempts"))
            }
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Outcome of a retry execution including result and summary statistics.
#[derive(Debug)]
pub struct RetryOutcome<T, E>
where
    E: std::error::Error + 'static,
{
    pub result: RetryResult<T, E>,
    /// Attempts actually started
    pub attempts: u32,
    /// Sum of backoff sleeps, excluding time spent in the operation
    pub total_delay: Duration,
    pub timed_out: bool,
    pub started_at: Instant,
}

impl<T, E> RetryOutcome<T, E>
where
    E: std::error::Error + 'static,
{
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> RetryResult<T, E> {
        self.result
    }

    /// Get the total elapsed time from first attempt to completion.
    pub fn total_elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Get the average delay between attempts (excludes operation execution
    /// time).
    pub fn average_delay(&self) -> Duration {
        if self.attempts <= 1 {
            return Duration::ZERO;
        }
        self.total_delay / (self.attempts - 1)
    }
}

/// Trait for determining whether an error should be retried
pub trait RetryPolicy<E> {
    /// Decide what to do after `attempt` attempts (1-based) have failed
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

/// Decision for whether to retry an operation
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry the operation with the default backoff delay
    Retry,
    /// Retry the operation after exactly this delay
    RetryAfter(Duration),
    /// Retry after the larger of this delay and the computed backoff
    RetryAtLeast(Duration),
    /// Don't retry the operation
    Stop,
}

/// Backoff strategy for calculating retry delays
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Linear backoff: initial_delay + (retry * increment)
    Linear { initial_delay: Duration, increment: Duration },
    /// Exponential backoff: initial_delay * base^retry, capped at max_delay
    Exponential { initial_delay: Duration, base: f64, max_delay: Duration },
}

impl BackoffStrategy {
    /// Delay before the retry following `retry` earlier retries (0 for the
    /// first retry)
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(delay) => *delay,
            BackoffStrategy::Linear { initial_delay, increment } => {
                initial_delay.saturating_add(increment.saturating_mul(retry))
            }
            BackoffStrategy::Exponential { initial_delay, base, max_delay } => {
                let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
                let delay = initial_delay.as_millis() as f64 * base.powi(exponent);
                let delay_ms = delay.min(max_delay.as_millis() as f64) as u64;
                Duration::from_millis(delay_ms)
            }
        }
    }
}

/// Jitter added on top of the computed backoff
#[derive(Debug, Clone, PartialEq)]
pub enum Jitter {
    /// No jitter
    None,
    /// Uniform jitter in `[0, ratio * delay]`, added to the delay
    Proportional(f64),
}

impl Jitter {
    /// Apply jitter to the calculated delay
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Proportional(ratio) => {
                if *ratio <= 0.0 || delay.is_zero() {
                    return delay;
                }
                let factor = rand::thread_rng().gen_range(0.0..=*ratio);
                delay + delay.mul_f64(factor)
            }
        }
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, the first one included
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
    /// Jitter type for randomizing delays
    pub jitter: Jitter,
    /// Minimum wait after a rate-limit error
    pub rate_limit_floor: Duration,
    /// Error kinds eligible for retry
    pub retryable_kinds: Vec<ErrorKind>,
    /// Maximum total time to spend retrying
    pub max_total_time: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                initial_delay: Duration::from_secs(1),
                base: 2.0,
                max_delay: Duration::from_secs(60),
            },
            jitter: Jitter::Proportional(0.1),
            rate_limit_floor: Duration::from_secs(5),
            retryable_kinds: ErrorKind::default_retryable().to_vec(),
            max_total_time: None,
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be greater than 0"));
        }

        if let BackoffStrategy::Exponential { base, .. } = &self.backoff {
            if !base.is_finite() || *base <= 0.0 {
                return Err(ConfigError::invalid("exponential base must be greater than 0"));
            }
        }

        if let Jitter::Proportional(ratio) = &self.jitter {
            if !(0.0..=1.0).contains(ratio) {
                return Err(ConfigError::invalid("jitter ratio must be within [0, 1]"));
            }
        }

        Ok(())
    }
}

/// Builder for RetryConfig with fluent API
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn fixed_backoff(mut self, delay: Duration) -> Self {
        self.config.backoff = BackoffStrategy::Fixed(delay);
        self
    }

    pub fn linear_backoff(mut self, initial_delay: Duration, increment: Duration) -> Self {
        self.config.backoff = BackoffStrategy::Linear { initial_delay, increment };
        self
    }

    pub fn exponential_backoff(
        mut self,
        initial_delay: Duration,
        base: f64,
        max_delay: Duration,
    ) -> Self {
        self.config.backoff = BackoffStrategy::Exponential { initial_delay, base, max_delay };
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.config.jitter = Jitter::None;
        self
    }

    pub fn jitter_ratio(mut self, ratio: f64) -> Self {
        self.config.jitter = Jitter::Proportional(ratio);
        self
    }

    pub fn rate_limit_floor(mut self, floor: Duration) -> Self {
        self.config.rate_limit_floor = floor;
        self
    }

    pub fn retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.config.retryable_kinds = kinds.into_iter().collect();
        self
    }

    pub fn max_total_time(mut self, duration: Duration) -> Self {
        self.config.max_total_time = Some(duration);
        self
    }

    pub fn unlimited_time(mut self) -> Self {
        self.config.max_total_time = None;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Retry statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Operation invocations across all executions
    pub total_attempts: u64,
    /// Invocations after the first one of an execution
    pub total_retries: u64,
    /// Executions that ended in success
    pub successes: u64,
    /// Executions that ended in an error
    pub failures: u64,
}

impl RetryStats {
    /// Fraction of finished executions that succeeded
    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct RetryCounters {
    total_attempts: AtomicU64,
    total_retries: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

/// The main retry executor
///
/// Cloning shares statistics and the metrics sink.
#[derive(Clone)]
pub struct RetryExecutor<P = KindRetryPolicy> {
    config: RetryConfig,
    policy: P,
    counters: Arc<RetryCounters>,
    metrics: Option<(Arc<MetricsRegistry>, String)>,
}

impl<P: fmt::Debug> fmt::Debug for RetryExecutor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("metrics", &self.metrics.as_ref().map(|(_, name)| name))
            .finish()
    }
}

impl RetryExecutor<KindRetryPolicy> {
    /// Executor retrying the config's allow-listed kinds
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if `config` fails validation.
    pub fn from_config(config: RetryConfig) -> ConfigResult<Self> {
        let policy = KindRetryPolicy::from_config(&config);
        Self::new(config, policy)
    }
}

impl Default for RetryExecutor<KindRetryPolicy> {
    fn default() -> Self {
        let config = RetryConfig::default();
        let policy = KindRetryPolicy::from_config(&config);
        Self::from_parts(config, policy)
    }
}

impl<P> RetryExecutor<P> {
    /// Create a new retry executor with the given configuration and policy
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if `config` fails validation.
    pub fn new(config: RetryConfig, policy: P) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, policy))
    }

    /// Create with default configuration
    pub fn with_policy(policy: P) -> Self {
        Self::from_parts(RetryConfig::default(), policy)
    }

    fn from_parts(config: RetryConfig, policy: P) -> Self {
        Self { config, policy, counters: Arc::new(RetryCounters::default()), metrics: None }
    }

    /// Feed attempt durations and final outcomes into `registry` under
    /// `operation`
    pub fn with_metrics(mut self, registry: Arc<MetricsRegistry>, operation: impl Into<String>) -> Self {
        self.metrics = Some((registry, operation.into()));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Snapshot of the executor's counters
    pub fn stats(&self) -> RetryStats {
        RetryStats {
            total_attempts: self.counters.total_attempts.load(Ordering::Relaxed),
            total_retries: self.counters.total_retries.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Execute an operation with retry logic
    #[instrument(skip(self, operation), fields(max_attempts = self.config.max_attempts))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        P: RetryPolicy<E>,
        E: ErrorClassification + std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, None).await.into_result()
    }

    /// Execute an operation, abandoning the loop when `token` is cancelled
    ///
    /// Cancellation during a backoff sleep does not count as an attempt.
    #[instrument(skip(self, operation, token), fields(max_attempts = self.config.max_attempts))]
    pub async fn execute_cancellable<F, Fut, T, E>(
        &self,
        operation: F,
        token: &CancellationToken,
    ) -> RetryResult<T, E>
    where
        P: RetryPolicy<E>,
        E: ErrorClassification + std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, Some(token)).await.into_result()
    }

    /// Execute an operation with retry logic and return outcome statistics.
    pub async fn execute_with_outcome<F, Fut, T, E>(&self, operation: F) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: ErrorClassification + std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, None).await
    }

    async fn run<F, Fut, T, E>(
        &self,
        mut operation: F,
        cancel: Option<&CancellationToken>,
    ) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: ErrorClassification + std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started_at = Instant::now();
        let mut attempts = 0u32;
        let mut total_delay = Duration::ZERO;

        let outcome = |result: RetryResult<T, E>,
                       attempts: u32,
                       total_delay: Duration,
                       timed_out: bool| RetryOutcome {
            result,
            attempts,
            total_delay,
            timed_out,
            started_at,
        };

        loop {
            attempts += 1;
            self.counters.total_attempts.fetch_add(1, Ordering::Relaxed);
            if attempts > 1 {
                self.counters.total_retries.fetch_add(1, Ordering::Relaxed);
            }

            debug!(attempt = attempts, max_attempts = self.config.max_attempts, "Executing operation");

            let attempt_started = std::time::Instant::now();
            let Some(result) = until_cancelled(operation(), cancel).await else {
                debug!(attempt = attempts, "Retry cancelled during attempt");
                return outcome(
                    Err(RetryError::Cancelled { attempts: attempts - 1 }),
                    attempts,
                    total_delay,
                    false,
                );
            };
            self.record_attempt(attempt_started.elapsed());

            let error = match result {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "Operation succeeded after retries");
                    }
                    self.record_success();
                    return outcome(Ok(value), attempts, total_delay, false);
                }
                Err(error) => error,
            };

            let decision = self.policy.should_retry(&error, attempts);
            if decision == RetryDecision::Stop {
                debug!(error = %error, kind = %error.kind(), "Retry policy determined not to retry");
                self.record_failure(error.kind());
                return outcome(
                    Err(RetryError::NonRetryable { source: error }),
                    attempts,
                    total_delay,
                    false,
                );
            }

            if attempts >= self.config.max_attempts {
                warn!(attempts, error = %error, "All retry attempts exhausted");
                self.record_failure(error.kind());
                return outcome(
                    Err(RetryError::AttemptsExhausted { attempts, source: error }),
                    attempts,
                    total_delay,
                    false,
                );
            }

            let delay = self.delay_for(&decision, attempts);

            if let Some(max_time) = self.config.max_total_time {
                let elapsed = started_at.elapsed();
                if elapsed + delay > max_time {
                    warn!(?elapsed, attempts, "Retry timeout exceeded");
                    self.record_failure(error.kind());
                    return outcome(
                        Err(RetryError::TimeoutExceeded { elapsed, source: error }),
                        attempts,
                        total_delay,
                        true,
                    );
                }
            }

            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Operation failed, retrying"
            );

            if until_cancelled(tokio::time::sleep(delay), cancel).await.is_none() {
                debug!(attempts, "Retry cancelled during backoff");
                return outcome(
                    Err(RetryError::Cancelled { attempts }),
                    attempts,
                    total_delay,
                    false,
                );
            }
            total_delay += delay;
        }
    }

    fn delay_for(&self, decision: &RetryDecision, attempts: u32) -> Duration {
        let backoff = || self.config.jitter.apply(self.config.backoff.calculate_delay(attempts - 1));
        match decision {
            RetryDecision::RetryAfter(delay) => *delay,
            RetryDecision::RetryAtLeast(floor) => backoff().max(*floor),
            RetryDecision::Retry | RetryDecision::Stop => backoff(),
        }
    }

    fn record_attempt(&self, duration: Duration) {
        if let Some((registry, name)) = &self.metrics {
            registry.record_duration(name, duration);
        }
    }

    fn record_success(&self) {
        self.counters.successes.fetch_add(1, Ordering::Relaxed);
        if let Some((registry, name)) = &self.metrics {
            registry.record_success(name);
        }
    }

    fn record_failure(&self, kind: ErrorKind) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        if let Some((registry, name)) = &self.metrics {
            registry.record_failure(name, kind);
        }
    }
}

/// Await `future` unless `cancel` fires first
async fn until_cancelled<Fut: Future>(
    future: Fut,
    cancel: Option<&CancellationToken>,
) -> Option<Fut::Output> {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => None,
            output = future => Some(output),
        },
        None => Some(future.await),
    }
}

/// Retry policy driven by [`ErrorKind`]
///
/// Kinds outside the allow-list stop immediately. Rate-limit errors wait at
/// least `rate_limit_floor` (or the upstream's hint, whichever is longer); any
/// other retry hint is honoured as a lower bound on the backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct KindRetryPolicy {
    retryable: Vec<ErrorKind>,
    rate_limit_floor: Duration,
}

impl KindRetryPolicy {
    pub fn new(retryable: impl IntoIterator<Item = ErrorKind>, rate_limit_floor: Duration) -> Self {
        Self { retryable: retryable.into_iter().collect(), rate_limit_floor }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.retryable_kinds.iter().copied(), config.rate_limit_floor)
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }
}

impl Default for KindRetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl<E: ErrorClassification> RetryPolicy<E> for KindRetryPolicy {
    fn should_retry(&self, error: &E, _attempt: u32) -> RetryDecision {
        let kind = error.kind();
        if !self.is_retryable(kind) {
            return RetryDecision::Stop;
        }

        match (kind, error.retry_after()) {
            (ErrorKind::RateLimit, hint) => {
                RetryDecision::RetryAtLeast(hint.unwrap_or_default().max(self.rate_limit_floor))
            }
            (_, Some(hint)) => RetryDecision::RetryAtLeast(hint),
            (_, None) => RetryDecision::Retry,
        }
    }
}

/// Pre-defined retry policies for common scenarios
pub mod policies {
    use super::*;

    pub use super::KindRetryPolicy;

    /// Always retry policy - retries on any error
    #[derive(Debug, Clone)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Retry
        }
    }

    /// Never retry policy - never retries
    #[derive(Debug, Clone)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Stop
        }
    }

    /// Predicate-based retry policy
    #[derive(Debug)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32) -> bool,
    {
        fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision {
            if (self.predicate)(error, attempt) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for retry strategies and policies
    //!
    //! Tests cover backoff arithmetic, jitter bounds, kind-based policy
    //! decisions, attempt accounting, rate-limit floors, deadlines and
    //! cancellation. Time-dependent tests run on a paused tokio clock.

    use std::sync::atomic::AtomicU32;

    use super::policies::*;
    use super::*;

    fn config(max_attempts: u32, base: Duration) -> RetryConfig {
        RetryConfig::builder()
            .max_attempts(max_attempts)
            .exponential_backoff(base, 2.0, Duration::from_secs(60))
            .no_jitter()
            .build()
            .unwrap()
    }

    /// Validates exponential backoff arithmetic.
    ///
    /// Assertions:
    /// - Confirms delays double from the base delay.
    /// - Confirms the delay is capped at `max_delay`.
    #[test]
    fn test_backoff_strategy_exponential() {
        let strategy = BackoffStrategy::Exponential {
            initial_delay: Duration::from_secs(1),
            base: 2.0,
            max_delay: Duration::from_secs(60),
        };

        assert_eq!(strategy.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(strategy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(strategy.calculate_delay(2), Duration::from_secs(4));
        assert_eq!(strategy.calculate_delay(10), Duration::from_secs(60));
        assert_eq!(strategy.calculate_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_strategy_fixed_and_linear() {
        let fixed = BackoffStrategy::Fixed(Duration::from_millis(100));
        assert_eq!(fixed.calculate_delay(7), Duration::from_millis(100));

        let linear = BackoffStrategy::Linear {
            initial_delay: Duration::from_millis(100),
            increment: Duration::from_millis(50),
        };
        assert_eq!(linear.calculate_delay(2), Duration::from_millis(200));
    }

    /// Validates proportional jitter bounds.
    ///
    /// Assertions:
    /// - Ensures jittered delays stay within `[delay, delay * 1.1]`.
    #[test]
    fn test_jitter_proportional_bounds() {
        let jitter = Jitter::Proportional(0.1);
        let delay = Duration::from_secs(2);

        for _ in 0..200 {
            let jittered = jitter.apply(delay);
            assert!(jittered >= delay);
            assert!(jittered <= Duration::from_millis(2200));
        }

        assert_eq!(Jitter::None.apply(delay), delay);
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.rate_limit_floor, Duration::from_secs(5));
        assert_eq!(config.jitter, Jitter::Proportional(0.1));
        assert_eq!(config.retryable_kinds, ErrorKind::default_retryable().to_vec());
        assert!(config.max_total_time.is_none());
    }

    #[test]
    fn test_retry_config_validation() {
        assert!(RetryConfig::builder().max_attempts(0).build().is_err());
        assert!(RetryConfig::builder()
            .exponential_backoff(Duration::from_secs(1), 0.0, Duration::from_secs(1))
            .build()
            .is_err());
        assert!(RetryConfig::builder().jitter_ratio(1.5).build().is_err());
        assert!(RetryConfig::builder().jitter_ratio(0.2).build().is_ok());
    }

    /// Validates that executors refuse hand-built configs the builder would
    /// reject.
    ///
    /// Assertions:
    /// - Confirms a NaN jitter ratio is rejected before any delay is drawn.
    /// - Confirms zero attempts is rejected for custom policies too.
    #[test]
    fn test_executor_validates_config() {
        let nan_jitter = RetryConfig { jitter: Jitter::Proportional(f64::NAN), ..RetryConfig::default() };
        assert!(matches!(
            RetryExecutor::from_config(nan_jitter),
            Err(ConfigError::Invalid { .. })
        ));

        let no_attempts = RetryConfig { max_attempts: 0, ..RetryConfig::default() };
        assert!(RetryExecutor::new(no_attempts, policies::AlwaysRetry).is_err());

        assert!(RetryExecutor::from_config(RetryConfig::default()).is_ok());
    }

    /// Validates `KindRetryPolicy` decisions.
    ///
    /// Assertions:
    /// - Confirms allow-listed kinds retry with the default backoff.
    /// - Confirms rate-limit errors retry no sooner than the floor.
    /// - Confirms a longer upstream hint wins over the floor.
    /// - Confirms kinds outside the allow-list stop.
    #[test]
    fn test_kind_retry_policy_decisions() {
        let policy = KindRetryPolicy::default();

        assert_eq!(policy.should_retry(&FetchError::upstream("503"), 1), RetryDecision::Retry);
        assert_eq!(
            policy.should_retry(&FetchError::rate_limited("429", None), 1),
            RetryDecision::RetryAtLeast(Duration::from_secs(5))
        );
        assert_eq!(
            policy.should_retry(
                &FetchError::rate_limited("429", Some(Duration::from_secs(30))),
                1
            ),
            RetryDecision::RetryAtLeast(Duration::from_secs(30))
        );
        assert_eq!(
            policy.should_retry(&FetchError::non_retryable("bad symbol"), 1),
            RetryDecision::Stop
        );
        assert_eq!(policy.should_retry(&FetchError::circuit_open(None), 1), RetryDecision::Stop);
    }

    #[test]
    fn test_predefined_policies() {
        let err = FetchError::non_retryable("x");
        assert_eq!(AlwaysRetry.should_retry(&err, 1), RetryDecision::Retry);
        assert_eq!(NeverRetry.should_retry(&FetchError::upstream("x"), 1), RetryDecision::Stop);

        let policy = PredicateRetry::new(|_: &FetchError, attempt| attempt < 2);
        assert_eq!(policy.should_retry(&err, 1), RetryDecision::Retry);
        assert_eq!(policy.should_retry(&err, 2), RetryDecision::Stop);
    }

    /// Validates that two transient failures followed by a success return the
    /// success after the full backoff.
    ///
    /// Assertions:
    /// - Confirms the operation runs three times.
    /// - Ensures at least 1s + 2s of (paused) time elapsed.
    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let executor = RetryExecutor::from_config(config(3, Duration::from_secs(1))).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let calls_clone = Arc::clone(&calls);
        let result = executor
            .execute(move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(FetchError::upstream(format!("attempt {n} failed")))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    /// Validates that exhausting attempts surfaces the last error.
    ///
    /// Assertions:
    /// - Confirms the error reports three attempts.
    /// - Confirms the source is the third attempt's error, not the first.
    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_surface_last_error() {
        let executor = RetryExecutor::from_config(config(3, Duration::from_millis(10))).unwrap();
        let calls = AtomicU32::new(0);

        let result: RetryResult<(), FetchError> = executor
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(FetchError::upstream(format!("failure {n}"))) }
            })
            .await;

        match result {
            Err(RetryError::AttemptsExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.message(), "failure 3");
            }
            other => panic!("expected AttemptsExhausted, got {other:?}"),
        }

        let err: FetchError =
            RetryError::AttemptsExhausted { attempts: 3, source: FetchError::upstream("last") }
                .into();
        assert_eq!(err, FetchError::upstream("last"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let executor = RetryExecutor::from_config(config(5, Duration::from_secs(1))).unwrap();
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: RetryResult<(), FetchError> = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::non_retryable("unknown symbol")) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::NonRetryable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    /// Validates the rate-limit floor.
    ///
    /// Assertions:
    /// - Ensures a rate-limited retry waits at least 5s even with a 10ms
    ///   base delay.
    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_floor_applies() {
        let executor = RetryExecutor::from_config(config(2, Duration::from_millis(10))).unwrap();
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let outcome = executor
            .execute_with_outcome(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(FetchError::rate_limited("429", None))
                    } else {
                        Ok("quote")
                    }
                }
            })
            .await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.total_delay, Duration::from_secs(5));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(outcome.into_result().unwrap(), "quote");
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_total_time_stops_before_sleeping_past_deadline() {
        let config = RetryConfig::builder()
            .max_attempts(10)
            .exponential_backoff(Duration::from_secs(1), 2.0, Duration::from_secs(60))
            .no_jitter()
            .max_total_time(Duration::from_secs(5))
            .build()
            .unwrap();
        let executor = RetryExecutor::from_config(config).unwrap();
        let calls = AtomicU32::new(0);

        let outcome: RetryOutcome<(), FetchError> = executor
            .execute_with_outcome(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::upstream("down")) }
            })
            .await;

        // 1s + 2s slept, the next 4s backoff would overrun the 5s budget.
        assert!(outcome.timed_out);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(outcome.result, Err(RetryError::TimeoutExceeded { .. })));
        let err: FetchError = outcome.result.unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    /// Validates cancellation during a backoff sleep.
    ///
    /// Assertions:
    /// - Confirms the loop returns `Cancelled` after the first attempt.
    /// - Confirms the cancelled wait is not counted as another attempt.
    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let executor = RetryExecutor::from_config(config(3, Duration::from_secs(10))).unwrap();
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: RetryResult<(), FetchError> = executor
            .execute_cancellable(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(FetchError::upstream("down")) }
                },
                &token,
            )
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.stats().total_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_track_attempts_and_outcomes() {
        let executor = RetryExecutor::from_config(config(2, Duration::from_millis(10))).unwrap();

        let _ = executor.execute(|| async { Ok::<_, FetchError>(1) }).await;
        let _: RetryResult<(), FetchError> =
            executor.execute(|| async { Err(FetchError::upstream("x")) }).await;

        let stats = executor.stats();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.total_retries, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert!((stats.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_feed() {
        let registry = Arc::new(MetricsRegistry::new());
        let executor = RetryExecutor::from_config(config(2, Duration::from_millis(10))).unwrap()
            .with_metrics(Arc::clone(&registry), "quote");

        let _: RetryResult<(), FetchError> =
            executor.execute(|| async { Err(FetchError::upstream("x")) }).await;

        let errors = registry.error_stats("quote").unwrap();
        assert_eq!(errors.total_errors, 1);
        assert_eq!(errors.by_kind.get(&ErrorKind::Upstream), Some(&1));
        assert_eq!(registry.operation_stats("quote").unwrap().count, 2);
    }

    #[test]
    fn test_retry_error_display() {
        let err: RetryError<FetchError> =
            RetryError::AttemptsExhausted { attempts: 3, source: FetchError::upstream("reset") };
        assert_eq!(
            err.to_string(),
            "All retry attempts exhausted after 3 tries: upstream error: reset"
        );
        assert!(err.last_error().is_some());
        assert!(RetryError::<FetchError>::Cancelled { attempts: 0 }.into_source().is_none());
    }
}
