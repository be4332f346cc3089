//! Observability primitives
//!
//! Metrics recording never fails the caller: lock poisoning is recovered with
//! a warning and aggregate reads on empty data fall back to zero.

pub mod metrics;

pub use metrics::{
    CacheMetricsSnapshot, ConcurrencySnapshot, ConcurrentRequestGuard, ErrorStats,
    MetricsRegistry, OperationStats, OperationTimer, Snapshot,
};

/// Metrics error type
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Empty data set - cannot calculate aggregate metric
    #[error("Empty data: cannot calculate {metric}")]
    EmptyData {
        /// Metric name that failed (e.g., "P95", "P50")
        metric: &'static str,
    },
}

/// Result type for metrics operations
pub type MetricsResult<T> = Result<T, MetricsError>;
