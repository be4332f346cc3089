//! Resilient fetch path
//!
//! [`ResilientFetcher`] stacks the components in this order:
//!
//! ```text
//! cache.get_or_fetch ─▶ retry ─▶ queue slot ─▶ circuit breaker ─▶ fetch
//! ```
//!
//! Coalescing sits outermost so concurrent callers share one retry loop.
//! Every attempt takes its own queue slot and the slot is released during
//! backoff sleeps. The breaker is checked when the attempt actually runs.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fetchguard_common::cache::{CacheStats, CoalescingCache};
use fetchguard_common::error::{FetchError, FetchResult};
use fetchguard_common::observability::{MetricsRegistry, Snapshot};
use fetchguard_common::queue::{BackpressureQueue, QueueMetrics, ShutdownMode};
use fetchguard_common::resilience::{
    CircuitBreaker, CircuitBreakerMetrics, Clock, RetryExecutor, RetryStats, SystemClock,
};
use tracing::{info, instrument, warn};

use crate::config::FetchguardConfig;
use crate::error::InfraResult;

const FETCH_OPERATION: &str = "fetch";

/// Value returned by [`ResilientFetcher::get_or_fetch_or_stale`]
#[derive(Debug, Clone, PartialEq)]
pub enum Served<V> {
    /// Served from a fresh entry or a successful fetch
    Fresh(V),
    /// Refresh failed; this is the last stored value
    Stale { value: V, error: FetchError },
}

impl<V> Served<V> {
    pub fn into_value(self) -> V {
        match self {
            Served::Fresh(value) | Served::Stale { value, .. } => value,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Served::Stale { .. })
    }
}

/// Point-in-time view of every component
#[derive(Debug, Clone)]
pub struct FetcherSnapshot {
    pub metrics: Snapshot,
    pub cache: CacheStats,
    pub breaker: CircuitBreakerMetrics,
    pub queue: QueueMetrics,
    pub retry: RetryStats,
}

/// Cache, retry, queue and breaker composed around one upstream
pub struct ResilientFetcher<V, C: Clock = SystemClock> {
    cache: CoalescingCache<V, C>,
    retry: RetryExecutor,
    breaker: CircuitBreaker<C>,
    queue: Arc<BackpressureQueue>,
    metrics: Arc<MetricsRegistry>,
}

impl<V, C: Clock> std::fmt::Debug for ResilientFetcher<V, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientFetcher")
            .field("cache", &self.cache)
            .field("breaker", &self.breaker)
            .field("queue", &self.queue)
            .finish()
    }
}

impl<V> ResilientFetcher<V, SystemClock>
where
    V: Clone + Send + Sync + 'static,
{
    /// Build every component from `config`
    ///
    /// Spawns the queue workers, so this must run inside a Tokio runtime.
    pub fn new(config: &FetchguardConfig) -> InfraResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<V, C> ResilientFetcher<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Clock + Clone,
{
    /// Build with a custom clock shared by the cache and the breaker
    pub fn with_clock(config: &FetchguardConfig, clock: C) -> InfraResult<Self> {
        let metrics = Arc::new(MetricsRegistry::new());

        let cache = CoalescingCache::with_clock(config.cache.to_config()?, clock.clone())?
            .with_metrics(Arc::clone(&metrics));
        let retry = RetryExecutor::from_config(config.retry.to_config()?)?
            .with_metrics(Arc::clone(&metrics), FETCH_OPERATION);
        let breaker = CircuitBreaker::with_clock(config.circuit_breaker.to_config()?, clock)?;
        let queue = Arc::new(BackpressureQueue::new(config.queue.to_config()?)?);

        info!(
            max_entries = config.cache.max_entries,
            max_attempts = config.retry.max_attempts,
            max_concurrent = config.queue.max_concurrent,
            "Resilient fetcher ready"
        );

        Ok(Self { cache, retry, breaker, queue, metrics })
    }

    /// Fresh value for `key`, fetching through the full resilience stack on a
    /// miss
    ///
    /// `fetch` may run several times (once per attempt) but at most one retry
    /// loop runs per key at a time.
    #[instrument(skip(self, fetch))]
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        ttl: Option<Duration>,
    ) -> FetchResult<V>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        let retry = self.retry.clone();
        let breaker = self.breaker.clone();
        let queue = Arc::clone(&self.queue);
        let metrics = Arc::clone(&self.metrics);
        let fetch = Arc::new(fetch);

        self.cache
            .get_or_fetch(
                key,
                move || async move {
                    retry
                        .execute(|| {
                            let breaker = breaker.clone();
                            let fetch = Arc::clone(&fetch);
                            let queue = Arc::clone(&queue);
                            let metrics = Arc::clone(&metrics);
                            async move {
                                queue
                                    .execute(move || async move {
                                        breaker
                                            .execute(|| {
                                                let in_flight = metrics.track_concurrent();
                                                let attempt = (*fetch)();
                                                async move {
                                                    let _in_flight = in_flight;
                                                    attempt.await
                                                }
                                            })
                                            .await
                                            .map_err(FetchError::from)
                                    })
                                    .await
                            }
                        })
                        .await
                        .map_err(FetchError::from)
                },
                ttl,
            )
            .await
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch), but falls back to the
    /// expired entry when the refresh fails
    ///
    /// The error is returned only when there is nothing stored for `key`.
    #[instrument(skip(self, fetch))]
    pub async fn get_or_fetch_or_stale<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        ttl: Option<Duration>,
    ) -> FetchResult<Served<V>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        match self.get_or_fetch(key, fetch, ttl).await {
            Ok(value) => Ok(Served::Fresh(value)),
            Err(error) => match self.cache.get_stale(key) {
                Some(value) => {
                    warn!(key, error = %error, "Refresh failed, serving stale value");
                    Ok(Served::Stale { value, error })
                }
                None => Err(error),
            },
        }
    }

    /// Drop one cached key, or everything when `key` is `None`
    pub fn invalidate(&self, key: Option<&str>) {
        self.cache.invalidate(key);
    }

    pub fn cache(&self) -> &CoalescingCache<V, C> {
        &self.cache
    }

    pub fn breaker(&self) -> &CircuitBreaker<C> {
        &self.breaker
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn snapshot(&self) -> FetcherSnapshot {
        FetcherSnapshot {
            metrics: self.metrics.snapshot(),
            cache: self.cache.stats(),
            breaker: self.breaker.metrics(),
            queue: self.queue.metrics(),
            retry: self.retry.stats(),
        }
    }

    /// Stop the queue and clear the cache; later fetches fail with
    /// `ShutDown`
    ///
    /// The cache is cleared after the queue settles, so values from drained
    /// fetches do not survive either.
    pub async fn shutdown(&self, mode: ShutdownMode) -> FetchResult<()> {
        info!(?mode, "Shutting down resilient fetcher");
        let result = self.queue.shutdown(mode).await;
        self.cache.invalidate(None);
        result
    }
}

/// Key for data that only changes once per `bucket`
///
/// Formats as `"{resource}:{bucket_start}"` where `bucket_start` is the Unix
/// second at which the bucket containing `now` began. Buckets shorter than a
/// second are treated as one second.
pub fn time_bucket_key(resource: &str, bucket: Duration, now: SystemTime) -> String {
    let bucket_secs = bucket.as_secs().max(1);
    let now_secs = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    format!("{resource}:{}", now_secs - now_secs % bucket_secs)
}
