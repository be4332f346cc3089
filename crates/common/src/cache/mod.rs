//! Coalescing TTL cache
//!
//! [`CoalescingCache`] keeps fetched values for a freshness window and makes
//! sure concurrent misses for the same key share a single fetch. Values are
//! stored only when the fetch succeeds; errors reach every waiter and leave
//! the store untouched.
//!
//! # Features
//!
//! - **Request coalescing**: one fetch per key at a time, any number of waiters
//! - **TTL expiry**: per-call TTL with a configurable default
//! - **Bounded size**: over `max_entries`, expired entries go first, then the
//!   ones closest to expiry
//! - **Stale reads**: [`CoalescingCache::get_stale`] returns expired values for
//!   fallback paths
//! - **Testable**: clock abstraction for deterministic expiry tests
//!
//! # Examples
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use fetchguard_common::cache::{CacheConfig, CoalescingCache};
//! use fetchguard_common::error::FetchError;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CacheConfig::builder()
//!     .max_entries(500)
//!     .default_ttl(Duration::from_secs(5))
//!     .build()?;
//! let cache: CoalescingCache<String> = CoalescingCache::new(config)?;
//!
//! // Ten concurrent callers, one upstream request
//! let calls = (0..10).map(|_| {
//!     cache.get_or_fetch("quote:AAPL", || async { Ok::<_, FetchError>("187.20".to_string()) }, None)
//! });
//! for result in futures::future::join_all(calls).await {
//!     assert_eq!(result?, "187.20");
//! }
//!
//! let stats = cache.stats();
//! println!("Hit rate: {:.2}%", stats.hit_rate() * 100.0);
//! # Ok(())
//! # }
//! ```

mod coalescing;
mod config;
mod stats;

pub use coalescing::{CoalescingCache, EntryInfo};
pub use config::{CacheConfig, CacheConfigBuilder};
pub use stats::CacheStats;
