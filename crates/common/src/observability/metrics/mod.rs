//! In-process metrics registry
//!
//! Tracks four families of metrics:
//! - **operations**: timing per operation name (see [`OperationStats`])
//! - **cache**: global hit/miss counters
//! - **errors**: success/failure outcomes per operation name, with failures
//!   broken down by [`ErrorKind`]
//! - **concurrency**: requests in flight right now and the high-water mark
//!
//! The registry is passed explicitly (`Arc<MetricsRegistry>`) to the
//! components that feed it; there is no process-global instance.
//!
//! ```
//! use std::time::Duration;
//!
//! use fetchguard_common::error::ErrorKind;
//! use fetchguard_common::observability::MetricsRegistry;
//!
//! let registry = MetricsRegistry::new();
//! registry.record_duration("quote", Duration::from_millis(12));
//! registry.record_success("quote");
//! registry.record_failure("quote", ErrorKind::RateLimit);
//!
//! let snapshot = registry.snapshot();
//! assert_eq!(snapshot.operations["quote"].count, 1);
//! assert_eq!(snapshot.errors["quote"].total_errors, 1);
//! ```

mod operation;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub use operation::{OperationStats, MAX_SAMPLES};
use operation::OperationMetrics;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::ErrorKind;

/// Cache hit/miss summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetricsSnapshot {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    /// Fraction of requests served from cache (0.0 to 1.0)
    pub hit_rate: f64,
    pub miss_rate: f64,
}

/// Outcome summary for one operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total_operations: u64,
    pub successes: u64,
    pub total_errors: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    /// Failures per error kind
    pub by_kind: BTreeMap<ErrorKind, u64>,
}

/// In-flight request gauge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencySnapshot {
    /// Requests currently holding a [`ConcurrentRequestGuard`]
    pub current: u64,
    /// Highest `current` seen since creation or the last reset
    pub peak: u64,
}

#[derive(Debug, Default)]
struct ConcurrencyCounters {
    current: AtomicU64,
    peak: AtomicU64,
}

#[derive(Debug, Default)]
struct OutcomeCounts {
    successes: u64,
    failures: BTreeMap<ErrorKind, u64>,
}

impl OutcomeCounts {
    fn stats(&self) -> ErrorStats {
        let total_errors: u64 = self.failures.values().sum();
        let total = self.successes + total_errors;
        let (success_rate, error_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            (self.successes as f64 / total as f64, total_errors as f64 / total as f64)
        };

        ErrorStats {
            total_operations: total,
            successes: self.successes,
            total_errors,
            success_rate,
            error_rate,
            by_kind: self.failures.clone(),
        }
    }
}

/// Point-in-time copy of every metric, serialisable for export
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub operations: BTreeMap<String, OperationStats>,
    pub cache: CacheMetricsSnapshot,
    pub errors: BTreeMap<String, ErrorStats>,
    #[serde(default)]
    pub concurrency: ConcurrencySnapshot,
}

/// Thread-safe metrics registry
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    operations: Mutex<HashMap<String, OperationMetrics>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    outcomes: Mutex<HashMap<String, OutcomeCounts>>,
    concurrency: Arc<ConcurrencyCounters>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing `operation`; the duration is recorded when the returned
    /// guard is dropped
    pub fn time_operation(&self, operation: impl Into<String>) -> OperationTimer<'_> {
        OperationTimer { registry: self, operation: operation.into(), started: Instant::now() }
    }

    /// Count one request as in flight until the returned guard is dropped
    ///
    /// The guard owns its counters, so it can travel into spawned tasks.
    pub fn track_concurrent(&self) -> ConcurrentRequestGuard {
        let counters = Arc::clone(&self.concurrency);
        let current = counters.current.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak.fetch_max(current, Ordering::SeqCst);
        ConcurrentRequestGuard { counters }
    }

    pub fn concurrency(&self) -> ConcurrencySnapshot {
        ConcurrencySnapshot {
            current: self.concurrency.current.load(Ordering::SeqCst),
            peak: self.concurrency.peak.load(Ordering::SeqCst),
        }
    }

    /// Record one timing sample for `operation`
    pub fn record_duration(&self, operation: &str, duration: Duration) {
        let mut operations = lock_or_recover(&self.operations, "MetricsRegistry::operations");
        match operations.get_mut(operation) {
            Some(metrics) => metrics.record(duration),
            None => {
                let mut metrics = OperationMetrics::default();
                metrics.record(duration);
                operations.insert(operation.to_string(), metrics);
            }
        }
    }

    pub fn record_cache_hit(&self, key: &str) {
        // SeqCst for a consistent hit_rate snapshot
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
        trace!(key, "cache hit recorded");
    }

    pub fn record_cache_miss(&self, key: &str) {
        self.cache_misses.fetch_add(1, Ordering::SeqCst);
        trace!(key, "cache miss recorded");
    }

    /// Record a successful outcome for `operation`
    pub fn record_success(&self, operation: &str) {
        let mut outcomes = lock_or_recover(&self.outcomes, "MetricsRegistry::outcomes");
        outcomes.entry(operation.to_string()).or_default().successes += 1;
    }

    /// Record a failed outcome for `operation`
    pub fn record_failure(&self, operation: &str, kind: ErrorKind) {
        let mut outcomes = lock_or_recover(&self.outcomes, "MetricsRegistry::outcomes");
        *outcomes.entry(operation.to_string()).or_default().failures.entry(kind).or_insert(0) += 1;
    }

    /// Timing summary for one operation
    pub fn operation_stats(&self, operation: &str) -> Option<OperationStats> {
        lock_or_recover(&self.operations, "MetricsRegistry::operations")
            .get(operation)
            .map(OperationMetrics::stats)
    }

    pub fn cache_metrics(&self) -> CacheMetricsSnapshot {
        let hits = self.cache_hits.load(Ordering::SeqCst);
        let misses = self.cache_misses.load(Ordering::SeqCst);
        let total = hits + misses;

        let (hit_rate, miss_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            (hits as f64 / total as f64, misses as f64 / total as f64)
        };

        CacheMetricsSnapshot { total_requests: total, hits, misses, hit_rate, miss_rate }
    }

    /// Outcome summary for one operation
    pub fn error_stats(&self, operation: &str) -> Option<ErrorStats> {
        lock_or_recover(&self.outcomes, "MetricsRegistry::outcomes")
            .get(operation)
            .map(OutcomeCounts::stats)
    }

    /// Copy every metric into a serialisable snapshot
    pub fn snapshot(&self) -> Snapshot {
        let operations = lock_or_recover(&self.operations, "MetricsRegistry::operations")
            .iter()
            .map(|(name, metrics)| (name.clone(), metrics.stats()))
            .collect();

        let errors = lock_or_recover(&self.outcomes, "MetricsRegistry::outcomes")
            .iter()
            .map(|(name, counts)| (name.clone(), counts.stats()))
            .collect();

        Snapshot { operations, cache: self.cache_metrics(), errors, concurrency: self.concurrency() }
    }

    /// Clear every metric
    pub fn reset(&self) {
        lock_or_recover(&self.operations, "MetricsRegistry::operations").clear();
        lock_or_recover(&self.outcomes, "MetricsRegistry::outcomes").clear();
        self.cache_hits.store(0, Ordering::SeqCst);
        self.cache_misses.store(0, Ordering::SeqCst);
        // Outstanding guards still decrement `current`
        let current = self.concurrency.current.load(Ordering::SeqCst);
        self.concurrency.peak.store(current, Ordering::SeqCst);
    }
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, metric: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poison_err) => {
            warn!(metric, "Mutex poisoned, recovering data");
            poison_err.into_inner()
        }
    }
}

/// Guard returned by [`MetricsRegistry::time_operation`]
#[derive(Debug)]
pub struct OperationTimer<'a> {
    registry: &'a MetricsRegistry,
    operation: String,
    started: Instant,
}

impl OperationTimer<'_> {
    /// Time elapsed since the timer started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for OperationTimer<'_> {
    fn drop(&mut self) {
        self.registry.record_duration(&self.operation, self.started.elapsed());
    }
}

/// Guard returned by [`MetricsRegistry::track_concurrent`]
#[derive(Debug)]
pub struct ConcurrentRequestGuard {
    counters: Arc<ConcurrencyCounters>,
}

impl Drop for ConcurrentRequestGuard {
    fn drop(&mut self) {
        self.counters.current.fetch_sub(1, Ordering::SeqCst);
    }
}
