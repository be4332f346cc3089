//! # fetchguard infrastructure
//!
//! Process-level wiring around the `fetchguard-common` components.
//!
//! This crate contains:
//! - Configuration loading (TOML/JSON files, `.env`, `FETCHGUARD_*` overrides)
//! - Tracing subscriber setup
//! - [`ResilientFetcher`], which composes the cache, retry executor,
//!   backpressure queue and circuit breaker around one upstream
//!
//! ## Architecture
//! - Depends on `fetchguard-common` for every resilience primitive
//! - Contains all "impure" code (file system, environment, global subscriber)

pub mod config;
pub mod error;
pub mod fetcher;
pub mod observability;

// Re-export commonly used items
pub use config::{load, load_from_env, load_from_file, FetchguardConfig, LoggingConfig};
pub use error::{InfraError, InfraResult};
pub use fetcher::{time_bucket_key, FetcherSnapshot, ResilientFetcher, Served};
pub use observability::init_tracing;
