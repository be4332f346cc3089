//! Coalescing TTL cache
//!
//! Every key owns a lazily created coordinator holding at most one in-flight
//! fetch. A miss takes the coordinator's lock, re-checks the store, and then
//! either joins the fetch already in flight or starts a new one. The fetch runs
//! on its own task, so a caller that stops waiting never cancels the fetch for
//! the callers that remain.
//!
//! Lock order is coordinator slot, then entry store, then coordinator map. No
//! lock is held across an `.await`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::stats::{CacheStats, MetricsCollector};
use crate::error::{ConfigResult, FetchError, FetchResult};
use crate::observability::MetricsRegistry;
use crate::resilience::{Clock, SystemClock};

type SharedFetch<V> = Shared<BoxFuture<'static, FetchResult<V>>>;

/// Upper bound on a single entry's lifetime, keeps `Instant` arithmetic in
/// range for absurd TTLs.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Per-key coordination token
struct KeyCoordinator<V> {
    in_flight: Mutex<Option<SharedFetch<V>>>,
}

impl<V> Default for KeyCoordinator<V> {
    fn default() -> Self {
        Self { in_flight: Mutex::new(None) }
    }
}

impl<V> KeyCoordinator<V> {
    /// No fetch in flight and nobody holding the slot
    fn is_idle(&self) -> bool {
        self.in_flight.try_lock().is_some_and(|slot| slot.is_none())
    }
}

/// Expiry details of a stored entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    /// Time left in the freshness window, zero once expired
    pub expires_in: Duration,
    pub is_expired: bool,
}

enum Lookup<V> {
    Ready(V),
    Pending(SharedFetch<V>),
}

struct Inner<V, C> {
    config: CacheConfig,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    coordinators: DashMap<String, Arc<KeyCoordinator<V>>>,
    metrics: MetricsCollector,
    clock: C,
}

/// Cache that collapses concurrent misses for a key into one fetch
///
/// Cloning is cheap and clones share the same store.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
///
/// use fetchguard_common::cache::{CacheConfig, CoalescingCache};
/// use fetchguard_common::error::FetchError;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let cache: CoalescingCache<f64> = CoalescingCache::new(CacheConfig::default())?;
///
/// let price = cache
///     .get_or_fetch("AAPL", || async { Ok::<_, FetchError>(187.2) }, Some(Duration::from_secs(5)))
///     .await?;
/// assert_eq!(price, 187.2);
/// # Ok(())
/// # }
/// ```
pub struct CoalescingCache<V, C: Clock = SystemClock> {
    inner: Arc<Inner<V, C>>,
    registry: Option<Arc<MetricsRegistry>>,
}

impl<V, C: Clock> Clone for CoalescingCache<V, C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner), registry: self.registry.clone() }
    }
}

impl<V, C: Clock> fmt::Debug for CoalescingCache<V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingCache")
            .field("config", &self.inner.config)
            .field("len", &self.inner.entries.read().len())
            .field("coordinators", &self.inner.coordinators.len())
            .finish()
    }
}

impl<V> CoalescingCache<V, SystemClock>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache using the system clock
    pub fn new(config: CacheConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<V, C> CoalescingCache<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Clock,
{
    /// Create a cache with a custom clock (useful for testing)
    pub fn with_clock(config: CacheConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                entries: RwLock::new(HashMap::new()),
                coordinators: DashMap::new(),
                metrics: MetricsCollector::default(),
                clock,
            }),
            registry: None,
        })
    }

    /// Report hits and misses to `registry` as well
    pub fn with_metrics(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Return the fresh value for `key`, fetching it at most once across all
    /// concurrent callers
    ///
    /// `ttl` falls back to the configured default. A failed fetch is handed
    /// to every caller waiting on it and nothing is stored.
    #[instrument(skip(self, fetch))]
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        ttl: Option<Duration>,
    ) -> FetchResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        match self.lookup_or_start(key, fetch, ttl) {
            Lookup::Ready(value) => Ok(value),
            Lookup::Pending(pending) => pending.await,
        }
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch), but gives up waiting when
    /// `token` is cancelled
    ///
    /// Only this caller's wait is abandoned. The fetch keeps running for any
    /// other waiter and still populates the cache.
    #[instrument(skip(self, fetch, token))]
    pub async fn get_or_fetch_cancellable<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        ttl: Option<Duration>,
        token: &CancellationToken,
    ) -> FetchResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        if token.is_cancelled() {
            return Err(FetchError::cancelled(format!("wait for {key} cancelled")));
        }

        let pending = match self.lookup_or_start(key, fetch, ttl) {
            Lookup::Ready(value) => return Ok(value),
            Lookup::Pending(pending) => pending,
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(key, "Caller stopped waiting for fetch");
                Err(FetchError::cancelled(format!("wait for {key} cancelled")))
            }
            result = pending => result,
        }
    }

    fn lookup_or_start<F, Fut>(&self, key: &str, fetch: F, ttl: Option<Duration>) -> Lookup<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        if let Some(value) = self.inner.fresh_value(key) {
            debug!(key, "Cache hit");
            self.record_hit(key);
            return Lookup::Ready(value);
        }
        self.record_miss(key);

        loop {
            let coordinator = Arc::clone(self.inner.coordinators.entry(key.to_string()).or_default().value());
            let mut slot = coordinator.in_flight.lock();

            // Invalidated or evicted between lookup and lock
            if !self.inner.is_registered(key, &coordinator) {
                continue;
            }

            // Another caller may have stored the value while we waited
            if let Some(value) = self.inner.fresh_value(key) {
                return Lookup::Ready(value);
            }

            if let Some(pending) = slot.as_ref() {
                debug!(key, "Joining in-flight fetch");
                self.inner.metrics.record_coalesced_wait();
                return Lookup::Pending(pending.clone());
            }

            debug!(key, "Starting fetch");
            let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
            let pending = Inner::start_fetch(&self.inner, key, fetch(), ttl, &coordinator);
            *slot = Some(pending.clone());
            return Lookup::Pending(pending);
        }
    }

    /// Fresh value for `key`, if any
    pub fn get(&self, key: &str) -> Option<V> {
        let value = self.inner.fresh_value(key);
        match value {
            Some(_) => self.record_hit(key),
            None => self.record_miss(key),
        }
        value
    }

    /// Stored value for `key` even if it has expired
    ///
    /// Intended as fallback data when a refresh fails; does not touch the
    /// hit/miss counters.
    pub fn get_stale(&self, key: &str) -> Option<V> {
        self.inner.entries.read().get(key).map(|entry| entry.value.clone())
    }

    /// Store `value` under `key` for `ttl` (or the default TTL)
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        self.inner.store(key.into(), value, ttl);
    }

    /// Remove one key (entry and coordinator), or everything when `key` is
    /// `None`
    pub fn invalidate(&self, key: Option<&str>) {
        match key {
            Some(key) => {
                self.inner.entries.write().remove(key);
                self.inner.coordinators.remove(key);
                debug!(key, "Cache key invalidated");
            }
            None => {
                let mut entries = self.inner.entries.write();
                let cleared = entries.len();
                entries.clear();
                self.inner.coordinators.clear();
                info!(cleared, "Cache cleared");
            }
        }
    }

    /// Expiry details for `key`
    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let now = self.inner.clock.now();
        self.inner.entries.read().get(key).map(|entry| EntryInfo {
            expires_in: entry.expires_at.saturating_duration_since(now),
            is_expired: !entry.is_fresh(now),
        })
    }

    /// Drop expired entries and idle coordinators without an entry, returning
    /// the number of entries removed
    pub fn cleanup_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let mut entries = self.inner.entries.write();

        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now));
        let removed = before - entries.len();

        self.inner
            .coordinators
            .retain(|key, coordinator| entries.contains_key(key) || !coordinator.is_idle());

        if removed > 0 {
            debug!(removed, "Expired cache entries cleaned up");
        }
        removed
    }

    /// Entries stored, fresh or expired
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// Snapshot of the cache statistics
    pub fn stats(&self) -> CacheStats {
        let now = self.inner.clock.now();
        let entries = self.inner.entries.read();
        let valid_keys = entries.values().filter(|entry| entry.is_fresh(now)).count();

        let mut stats = CacheStats {
            total_keys: entries.len(),
            valid_keys,
            expired_keys: entries.len() - valid_keys,
            max_entries: self.inner.config.max_entries,
            ..CacheStats::default()
        };
        self.inner.metrics.fill(&mut stats);
        stats
    }

    fn record_hit(&self, key: &str) {
        self.inner.metrics.record_hit();
        if let Some(registry) = &self.registry {
            registry.record_cache_hit(key);
        }
    }

    fn record_miss(&self, key: &str) {
        self.inner.metrics.record_miss();
        if let Some(registry) = &self.registry {
            registry.record_cache_miss(key);
        }
    }
}

impl<V, C> Inner<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Clock,
{
    fn fresh_value(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.value.clone())
    }

    fn is_registered(&self, key: &str, coordinator: &Arc<KeyCoordinator<V>>) -> bool {
        self.coordinators.get(key).is_some_and(|current| Arc::ptr_eq(current.value(), coordinator))
    }

    /// Spawn the fetch; the returned future can be awaited by any number of
    /// callers
    fn start_fetch<Fut>(
        inner: &Arc<Self>,
        key: &str,
        fetch: Fut,
        ttl: Duration,
        coordinator: &Arc<KeyCoordinator<V>>,
    ) -> SharedFetch<V>
    where
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        let inner = Arc::clone(inner);
        let coordinator = Arc::clone(coordinator);
        let key = key.to_string();

        let task = tokio::spawn(async move {
            let result = AssertUnwindSafe(fetch)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(FetchError::non_retryable("fetch operation panicked")));
            inner.complete_fetch(&key, &coordinator, &result, ttl);
            result
        });

        async move {
            task.await.unwrap_or_else(|join_err| {
                Err(FetchError::non_retryable(format!("fetch task failed: {join_err}")))
            })
        }
        .boxed()
        .shared()
    }

    fn complete_fetch(
        &self,
        key: &str,
        coordinator: &Arc<KeyCoordinator<V>>,
        result: &FetchResult<V>,
        ttl: Duration,
    ) {
        let mut slot = coordinator.in_flight.lock();

        match result {
            Ok(value) => {
                self.metrics.record_fetch();
                if self.is_registered(key, coordinator) {
                    self.store(key.to_string(), value.clone(), ttl);
                } else {
                    debug!(key, "Key invalidated during fetch, result not cached");
                }
            }
            Err(error) => {
                self.metrics.record_fetch_failure();
                warn!(key, error = %error, "Fetch failed, nothing cached");
            }
        }

        *slot = None;
        drop(slot);
        self.release_coordinator(key, coordinator);
    }

    /// Drop the coordinator for a key that ended up with nothing stored
    ///
    /// The entries lock is released before touching the map, and a caller
    /// that joined or restarted in the meantime keeps it alive.
    fn release_coordinator(&self, key: &str, coordinator: &Arc<KeyCoordinator<V>>) {
        let has_entry = self.entries.read().contains_key(key);
        if !has_entry {
            self.coordinators
                .remove_if(key, |_, current| Arc::ptr_eq(current, coordinator) && current.is_idle());
        }
    }

    fn store(&self, key: String, value: V, ttl: Duration) {
        let now = self.clock.now();
        let expires_at = now + ttl.min(MAX_TTL);

        let mut entries = self.entries.write();
        entries.insert(key, CacheEntry { value, expires_at });

        if entries.len() > self.config.max_entries {
            self.evict(&mut entries, now);
        }
    }

    /// Bring the store back under `max_entries`: expired entries first, then
    /// the entries closest to expiry
    fn evict(&self, entries: &mut HashMap<String, CacheEntry<V>>, now: Instant) {
        let mut evicted: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_fresh(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &evicted {
            entries.remove(key);
        }

        if entries.len() > self.config.max_entries {
            let mut by_expiry: Vec<(Instant, String)> =
                entries.iter().map(|(key, entry)| (entry.expires_at, key.clone())).collect();
            by_expiry.sort_unstable();

            let excess = entries.len() - self.config.max_entries;
            for (_, key) in by_expiry.into_iter().take(excess) {
                entries.remove(&key);
                evicted.push(key);
            }
        }

        for key in &evicted {
            self.coordinators.remove_if(key, |_, coordinator| coordinator.is_idle());
        }

        self.metrics.record_evictions(evicted.len());
        debug!(evicted = evicted.len(), remaining = entries.len(), "Cache entries evicted");
    }
}
