//! Cache statistics and metrics tracking

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for cache performance monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently stored, fresh or expired
    pub total_keys: usize,

    /// Entries still inside their freshness window
    pub valid_keys: usize,

    /// Entries past expiry that have not been swept yet
    pub expired_keys: usize,

    /// Configured entry limit
    pub max_entries: usize,

    /// Lookups answered from a fresh entry
    pub hits: u64,

    /// Lookups that found no fresh entry
    pub misses: u64,

    /// Fetches that completed successfully
    pub fetches: u64,

    /// Fetches that returned an error
    pub fetch_failures: u64,

    /// Entries removed by the size-limit sweep
    pub evictions: u64,

    /// Callers that joined a fetch already in flight
    pub coalesced_waits: u64,
}

impl CacheStats {
    /// Calculate hit rate (hits / total accesses)
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_accesses();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate miss rate (misses / total accesses)
    pub fn miss_rate(&self) -> f64 {
        let total = self.total_accesses();
        if total == 0 {
            0.0
        } else {
            self.misses as f64 / total as f64
        }
    }

    /// Total number of access operations (hits + misses)
    pub fn total_accesses(&self) -> u64 {
        self.hits + self.misses
    }
}

/// Lock-free counters behind [`CacheStats`]
#[derive(Debug, Default)]
pub(crate) struct MetricsCollector {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    evictions: AtomicU64,
    coalesced_waits: AtomicU64,
}

impl MetricsCollector {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced_wait(&self) {
        self.coalesced_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Fill the counter fields of `stats`
    pub(crate) fn fill(&self, stats: &mut CacheStats) {
        stats.hits = self.hits.load(Ordering::Relaxed);
        stats.misses = self.misses.load(Ordering::Relaxed);
        stats.fetches = self.fetches.load(Ordering::Relaxed);
        stats.fetch_failures = self.fetch_failures.load(Ordering::Relaxed);
        stats.evictions = self.evictions.load(Ordering::Relaxed);
        stats.coalesced_waits = self.coalesced_waits.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats { hits: 3, misses: 1, ..Default::default() };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert!((stats.miss_rate() - 0.25).abs() < f64::EPSILON);
        assert_eq!(stats.total_accesses(), 4);

        assert_eq!(CacheStats::default().hit_rate(), 0.0);
        assert_eq!(CacheStats::default().miss_rate(), 0.0);
    }

    #[test]
    fn test_collector_fill() {
        let collector = MetricsCollector::default();
        collector.record_hit();
        collector.record_miss();
        collector.record_miss();
        collector.record_fetch();
        collector.record_fetch_failure();
        collector.record_evictions(3);
        collector.record_coalesced_wait();

        let mut stats = CacheStats::default();
        collector.fill(&mut stats);

        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.fetch_failures, 1);
        assert_eq!(stats.evictions, 3);
        assert_eq!(stats.coalesced_waits, 1);
    }
}
