//! Integration tests for configuration loader
//!
//! Tests the end-to-end behavior of loading configuration files and turning
//! them into working components.

#![cfg(feature = "runtime")]

use std::io::Write;
use std::time::Duration;

use fetchguard_common::error::ErrorKind;
use fetchguard_infra::config::{self, FetchguardConfig};
use fetchguard_infra::{InfraError, ResilientFetcher};
use tempfile::{Builder, NamedTempFile};

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().expect("Failed to create temp file");
    file.write_all(contents.as_bytes()).expect("Failed to write config");
    file
}

#[test]
fn test_load_full_toml_file() {
    let file = write_config(
        ".toml",
        r#"
[cache]
max_entries = 250
default_ttl_ms = 60000

[retry]
max_attempts = 4
base_delay_ms = 500
backoff_multiplier = 3.0
max_delay_ms = 20000
jitter_ratio = 0.2
rate_limit_floor_ms = 10000
retryable_kinds = ["upstream", "rate_limit"]

[circuit_breaker]
failure_threshold = 3
expected_successes = 2
recovery_timeout_secs = 30
reset_on_success = false

[queue]
max_queue_size = 50
max_concurrent = 5
shutdown_timeout_ms = 2000

[logging]
level = "fetchguard=debug,info"
json = true
"#,
    );

    let config = config::load_from_file(Some(file.path().to_path_buf())).expect("config loads");

    assert_eq!(config.cache.max_entries, 250);
    assert_eq!(config.cache.default_ttl, Duration::from_secs(60));
    assert_eq!(config.retry.max_attempts, 4);
    assert_eq!(config.retry.retryable_kinds, vec![ErrorKind::Upstream, ErrorKind::RateLimit]);
    assert_eq!(config.retry.max_total_time, None);
    assert!(!config.circuit_breaker.reset_on_success);
    assert_eq!(config.queue.shutdown_timeout, Duration::from_secs(2));
    assert_eq!(config.logging.level, "fetchguard=debug,info");

    let breaker = config.circuit_breaker.to_config().unwrap();
    assert_eq!(breaker.recovery_timeout, Duration::from_secs(30));
    let queue = config.queue.to_config().unwrap();
    assert_eq!(queue.capacity(), 55);
}

#[test]
fn test_json_and_toml_agree() {
    let toml_file = write_config(".toml", "[queue]\nmax_queue_size = 7\nmax_concurrent = 3\n");
    let json_file =
        write_config(".json", r#"{"queue": {"max_queue_size": 7, "max_concurrent": 3}}"#);

    let from_toml = config::load_from_file(Some(toml_file.path().to_path_buf())).unwrap();
    let from_json = config::load_from_file(Some(json_file.path().to_path_buf())).unwrap();
    assert_eq!(from_toml, from_json);
}

#[test]
fn test_serialized_config_round_trips_through_file() {
    let mut original = FetchguardConfig::default();
    original.retry.max_total_time = Some(Duration::from_secs(90));
    original.circuit_breaker.failure_threshold = 8;

    let file = write_config(".toml", &toml::to_string(&original).unwrap());
    let loaded = config::load_from_file(Some(file.path().to_path_buf())).unwrap();
    assert_eq!(loaded, original);
}

#[test]
fn test_malformed_file_reports_path() {
    let file = write_config(".toml", "[retry\nmax_attempts = 3\n");

    let err = config::load_from_file(Some(file.path().to_path_buf())).unwrap_err();
    match err {
        InfraError::Parse { path, .. } => assert_eq!(path, file.path()),
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[test]
fn test_invalid_values_rejected() {
    let file = write_config(".toml", "[retry]\nmax_attempts = 0\n");

    let err = config::load_from_file(Some(file.path().to_path_buf())).unwrap_err();
    assert!(matches!(err, InfraError::Config(_)));
    assert!(err.to_string().contains("Invalid configuration"));
}

#[tokio::test]
async fn test_loaded_config_builds_fetcher() {
    let file = write_config(".toml", "[queue]\nmax_queue_size = 1\nmax_concurrent = 1\n");
    let config = config::load_from_file(Some(file.path().to_path_buf())).unwrap();

    let fetcher: ResilientFetcher<String> = ResilientFetcher::new(&config).unwrap();
    let value = fetcher.get_or_fetch("k", || async { Ok("v".to_string()) }, None).await.unwrap();
    assert_eq!(value, "v");
    assert_eq!(fetcher.snapshot().queue.max_queue_size, 1);
}
