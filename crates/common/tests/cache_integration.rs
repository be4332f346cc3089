//! Integration tests for the coalescing cache
//!
//! Exercises coalescing under a multi-threaded runtime and the interplay of
//! expiry, stale reads and invalidation through the public API only.

#![cfg(feature = "runtime")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fetchguard_common::cache::{CacheConfig, CoalescingCache};
use fetchguard_common::error::{ErrorKind, FetchError};
use fetchguard_common::resilience::MockClock;

/// Validates coalescing across worker threads.
///
/// # Test Steps
/// 1. Spawn 50 tasks on a multi-thread runtime, all missing the same key
/// 2. The fetch sleeps so every task arrives while it is in flight
/// 3. Verify the upstream was called once and every task got its value
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coalescing_across_threads() {
    let cache: CoalescingCache<String> = CoalescingCache::new(CacheConfig::default()).unwrap();
    let upstream_calls = Arc::new(AtomicU32::new(0));

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let cache = cache.clone();
            let upstream_calls = Arc::clone(&upstream_calls);
            tokio::spawn(async move {
                cache
                    .get_or_fetch(
                        "quote:MSFT",
                        move || async move {
                            upstream_calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok("415.10".to_string())
                        },
                        None,
                    )
                    .await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), "415.10");
    }
    assert_eq!(upstream_calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().fetches, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_distinct_keys_fetch_independently() {
    let cache: CoalescingCache<u32> = CoalescingCache::new(CacheConfig::default()).unwrap();
    let upstream_calls = Arc::new(AtomicU32::new(0));

    let tasks: Vec<_> = (0..10u32)
        .map(|i| {
            let cache = cache.clone();
            let upstream_calls = Arc::clone(&upstream_calls);
            tokio::spawn(async move {
                let key = format!("k{i}");
                cache
                    .get_or_fetch(
                        &key,
                        move || async move {
                            upstream_calls.fetch_add(1, Ordering::SeqCst);
                            Ok(i)
                        },
                        None,
                    )
                    .await
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap().unwrap(), i as u32);
    }
    assert_eq!(upstream_calls.load(Ordering::SeqCst), 10);
    assert_eq!(cache.len(), 10);
}

/// Validates the stale-read fallback path after expiry and a failed refresh.
///
/// # Test Steps
/// 1. Populate a key, then let it expire
/// 2. Refresh fails with an upstream error
/// 3. Verify the error surfaces and the old value is still readable as stale
#[tokio::test]
async fn test_stale_value_survives_failed_refresh() {
    let clock = MockClock::new();
    let cache = CoalescingCache::with_clock(CacheConfig::default(), clock.clone()).unwrap();

    cache.get_or_fetch("idx", || async { Ok(100u32) }, Some(Duration::from_secs(5))).await.unwrap();
    clock.advance_secs(6);

    let err = cache
        .get_or_fetch("idx", || async { Err(FetchError::upstream("503")) }, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Upstream);

    assert_eq!(cache.get("idx"), None);
    assert_eq!(cache.get_stale("idx"), Some(100));
}

#[tokio::test]
async fn test_size_limit_holds_under_many_inserts() {
    let clock = MockClock::new();
    let config = CacheConfig::builder().max_entries(25).build().unwrap();
    let cache = CoalescingCache::with_clock(config, clock.clone()).unwrap();

    for i in 0..100u64 {
        cache
            .get_or_fetch(&format!("k{i}"), move || async move { Ok(i) }, Some(Duration::from_secs(i + 1)))
            .await
            .unwrap();
        assert!(cache.len() <= 25);
    }

    // Longest-lived entries are the ones that remain
    assert_eq!(cache.get("k99"), Some(99));
    assert_eq!(cache.get("k0"), None);
    assert_eq!(cache.stats().evictions, 75);
}

#[tokio::test]
async fn test_set_then_get_or_fetch_skips_upstream() {
    let cache: CoalescingCache<&'static str> =
        CoalescingCache::new(CacheConfig::default()).unwrap();
    cache.set("warm", "preloaded", Some(Duration::from_secs(60)));

    let value = cache
        .get_or_fetch("warm", || async { Err(FetchError::upstream("should not run")) }, None)
        .await
        .unwrap();
    assert_eq!(value, "preloaded");

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.fetches, 0);
}
