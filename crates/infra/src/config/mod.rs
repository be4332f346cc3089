//! Configuration loading and management
//!
//! [`FetchguardConfig`] is the file/env representation of every component's
//! settings. Durations are spelled as integers with a unit suffix
//! (`default_ttl_ms`, `recovery_timeout_secs`); every field has a default so
//! partial files are fine.

pub mod loader;

use std::time::Duration;

use fetchguard_common::cache::CacheConfig;
use fetchguard_common::error::{ConfigResult, ErrorKind};
use fetchguard_common::queue::QueueConfig;
use fetchguard_common::resilience::{CircuitBreakerConfig, RetryConfig};
use fetchguard_common::utils::{duration_millis, duration_secs, option_duration_millis};
use serde::{Deserialize, Serialize};

use crate::error::InfraResult;

// Re-export commonly used items
pub use loader::{load, load_from_env, load_from_file, probe_config_paths};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchguardConfig {
    pub cache: CacheSettings,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub queue: QueueSettings,
    pub logging: LoggingConfig,
}

impl FetchguardConfig {
    /// Check that every section converts into a valid component config
    pub fn validate(&self) -> InfraResult<()> {
        self.cache.to_config()?;
        self.retry.to_config()?;
        self.circuit_breaker.to_config()?;
        self.queue.to_config()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_entries: usize,
    #[serde(rename = "default_ttl_ms", with = "duration_millis")]
    pub default_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self { max_entries: defaults.max_entries, default_ttl: defaults.default_ttl }
    }
}

impl CacheSettings {
    pub fn to_config(&self) -> ConfigResult<CacheConfig> {
        CacheConfig::builder().max_entries(self.max_entries).default_ttl(self.default_ttl).build()
    }
}

/// Retry settings; backoff is always exponential when loaded from config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, first one included
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_millis")]
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the backoff
    pub jitter_ratio: f64,
    #[serde(rename = "rate_limit_floor_ms", with = "duration_millis")]
    pub rate_limit_floor: Duration,
    pub retryable_kinds: Vec<ErrorKind>,
    #[serde(rename = "max_total_time_ms", with = "option_duration_millis")]
    pub max_total_time: Option<Duration>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter_ratio: 0.1,
            rate_limit_floor: Duration::from_secs(5),
            retryable_kinds: ErrorKind::default_retryable().to_vec(),
            max_total_time: None,
        }
    }
}

impl RetrySettings {
    pub fn to_config(&self) -> ConfigResult<RetryConfig> {
        let builder = RetryConfig::builder()
            .max_attempts(self.max_attempts)
            .exponential_backoff(self.base_delay, self.backoff_multiplier, self.max_delay)
            .jitter_ratio(self.jitter_ratio)
            .rate_limit_floor(self.rate_limit_floor)
            .retryable_kinds(self.retryable_kinds.iter().copied());

        match self.max_total_time {
            Some(limit) => builder.max_total_time(limit).build(),
            None => builder.unlimited_time().build(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u64,
    pub expected_successes: u64,
    #[serde(rename = "recovery_timeout_secs", with = "duration_secs")]
    pub recovery_timeout: Duration,
    pub reset_on_success: bool,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            expected_successes: defaults.expected_successes,
            recovery_timeout: defaults.recovery_timeout,
            reset_on_success: defaults.reset_on_success,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> ConfigResult<CircuitBreakerConfig> {
        CircuitBreakerConfig::builder()
            .failure_threshold(self.failure_threshold)
            .expected_successes(self.expected_successes)
            .recovery_timeout(self.recovery_timeout)
            .reset_on_success(self.reset_on_success)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_queue_size: usize,
    pub max_concurrent: usize,
    #[serde(rename = "shutdown_timeout_ms", with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        let defaults = QueueConfig::default();
        Self {
            max_queue_size: defaults.max_queue_size,
            max_concurrent: defaults.max_concurrent,
            shutdown_timeout: defaults.shutdown_timeout,
        }
    }
}

impl QueueSettings {
    pub fn to_config(&self) -> ConfigResult<QueueConfig> {
        QueueConfig::builder()
            .max_queue_size(self.max_queue_size)
            .max_concurrent(self.max_concurrent)
            .shutdown_timeout(self.shutdown_timeout)
            .build()
    }
}

/// Tracing subscriber settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}
