//! Per-operation timing statistics
//!
//! ## Design
//! - **VecDeque ring buffer** of the last 1000 samples for percentiles
//! - Count, total, min and max cover every sample ever recorded, not only the
//!   ones still in the ring

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::observability::{MetricsError, MetricsResult};

/// Samples retained for percentile calculations
pub const MAX_SAMPLES: usize = 1000;

/// Raw timing state for one operation name
#[derive(Debug, Default)]
pub(crate) struct OperationMetrics {
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
    samples: VecDeque<Duration>,
}

impl OperationMetrics {
    pub(crate) fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.min = Some(self.min.map_or(duration, |min| min.min(duration)));
        self.max = self.max.max(duration);

        self.samples.push_back(duration);
        if self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
    }

    /// Percentile over the retained samples
    ///
    /// Returns `MetricsError::EmptyData` if no samples were recorded.
    fn percentile(&self, percentile: f64, metric: &'static str) -> MetricsResult<Duration> {
        if self.samples.is_empty() {
            return Err(MetricsError::EmptyData { metric });
        }

        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let index = ((sorted.len() as f64 * percentile) as usize).min(sorted.len() - 1);
        Ok(sorted[index])
    }

    pub(crate) fn stats(&self) -> OperationStats {
        let percentile = |p, metric| {
            self.percentile(p, metric).map(as_ms).unwrap_or_else(|err| {
                debug!(error = %err, "Percentile unavailable");
                0.0
            })
        };

        let total_ms = as_ms(self.total);
        let avg_ms = if self.count == 0 { 0.0 } else { total_ms / self.count as f64 };

        OperationStats {
            count: self.count,
            total_ms,
            min_ms: self.min.map_or(0.0, as_ms),
            max_ms: as_ms(self.max),
            avg_ms,
            p50_ms: percentile(0.50, "P50"),
            p95_ms: percentile(0.95, "P95"),
            p99_ms: percentile(0.99, "P99"),
        }
    }
}

fn as_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Timing summary for one operation, in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_tracks_min_max_avg() {
        let mut metrics = OperationMetrics::default();
        metrics.record(Duration::from_millis(100));
        metrics.record(Duration::from_millis(300));
        metrics.record(Duration::from_millis(200));

        let stats = metrics.stats();
        assert_eq!(stats.count, 3);
        assert!((stats.min_ms - 100.0).abs() < 1e-6);
        assert!((stats.max_ms - 300.0).abs() < 1e-6);
        assert!((stats.avg_ms - 200.0).abs() < 1e-6);
        assert!((stats.total_ms - 600.0).abs() < 1e-6);
    }

    #[test]
    fn test_percentiles() {
        let mut metrics = OperationMetrics::default();
        for ms in 1..=100 {
            metrics.record(Duration::from_millis(ms));
        }

        let stats = metrics.stats();
        assert!((stats.p50_ms - 51.0).abs() < 1e-6);
        assert!((stats.p95_ms - 96.0).abs() < 1e-6);
        assert!((stats.p99_ms - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_ring_buffer_keeps_last_samples() {
        let mut metrics = OperationMetrics::default();
        for _ in 0..MAX_SAMPLES {
            metrics.record(Duration::from_secs(10));
        }
        for _ in 0..MAX_SAMPLES {
            metrics.record(Duration::from_millis(1));
        }

        let stats = metrics.stats();
        assert_eq!(stats.count, 2 * MAX_SAMPLES as u64);
        assert!((stats.p99_ms - 1.0).abs() < 1e-6, "old samples should be evicted");
        assert!((stats.max_ms - 10_000.0).abs() < 1e-6, "max covers every sample");
    }

    #[test]
    fn test_empty_percentile_is_error() {
        let metrics = OperationMetrics::default();
        assert!(matches!(
            metrics.percentile(0.5, "P50"),
            Err(MetricsError::EmptyData { metric: "P50" })
        ));
        assert_eq!(metrics.stats(), OperationStats::default());
    }
}
