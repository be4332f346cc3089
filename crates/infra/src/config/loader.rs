//! Configuration loader
//!
//! ## Loading Strategy
//! 1. Load a `.env` file from the working directory, if present
//! 2. Start from `FETCHGUARD_CONFIG` if set, otherwise the first probed config
//!    file, otherwise built-in defaults
//! 3. Apply `FETCHGUARD_*` environment overrides on top
//! 4. Validate the result
//!
//! ## Environment Variables
//! - `FETCHGUARD_CONFIG`: Explicit config file path
//! - `FETCHGUARD_CACHE_MAX_ENTRIES`, `FETCHGUARD_CACHE_DEFAULT_TTL_MS`
//! - `FETCHGUARD_RETRY_MAX_ATTEMPTS`, `FETCHGUARD_RETRY_BASE_DELAY_MS`,
//!   `FETCHGUARD_RETRY_MAX_DELAY_MS`, `FETCHGUARD_RETRY_RATE_LIMIT_FLOOR_MS`,
//!   `FETCHGUARD_RETRY_MAX_TOTAL_TIME_MS`, `FETCHGUARD_RETRY_BACKOFF_MULTIPLIER`,
//!   `FETCHGUARD_RETRY_JITTER_RATIO`
//! - `FETCHGUARD_BREAKER_FAILURE_THRESHOLD`,
//!   `FETCHGUARD_BREAKER_EXPECTED_SUCCESSES`,
//!   `FETCHGUARD_BREAKER_RECOVERY_TIMEOUT_SECS`
//! - `FETCHGUARD_QUEUE_MAX_SIZE`, `FETCHGUARD_QUEUE_MAX_CONCURRENT`,
//!   `FETCHGUARD_QUEUE_SHUTDOWN_TIMEOUT_MS`
//! - `FETCHGUARD_LOG_LEVEL`, `FETCHGUARD_LOG_JSON`
//!
//! ## File Locations
//! The loader probes the following paths (in order):
//! 1. `./fetchguard.toml` or `./fetchguard.json` (current working directory)
//! 2. `./config.toml` or `./config.json` (current working directory)
//! 3. The same names in the parent and grandparent directories
//! 4. Relative to executable location

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::FetchguardConfig;
use crate::error::{InfraError, InfraResult};

const CONFIG_PATH_VAR: &str = "FETCHGUARD_CONFIG";
const FILE_NAMES: [&str; 4] = ["fetchguard.toml", "fetchguard.json", "config.toml", "config.json"];

/// Load configuration with the full layering strategy
///
/// # Errors
/// Returns `InfraError` if an explicit config file is missing or invalid, an
/// environment override does not parse, or the final config fails
/// validation.
pub fn load() -> InfraResult<FetchguardConfig> {
    match dotenvy::dotenv() {
        Ok(path) => debug!(path = %path.display(), "Loaded .env file"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "Could not load .env file"),
    }

    let base = match std::env::var(CONFIG_PATH_VAR) {
        Ok(path) => load_from_file(Some(PathBuf::from(path)))?,
        Err(_) => match probe_config_paths() {
            Some(path) => load_from_file(Some(path))?,
            None => {
                debug!("No config file found, using defaults");
                FetchguardConfig::default()
            }
        },
    };

    let config = apply_env_overrides(base, |key| std::env::var(key).ok())?;
    config.validate()?;
    info!("Configuration loaded");
    Ok(config)
}

/// Defaults with `FETCHGUARD_*` environment overrides applied
///
/// # Errors
/// Returns `InfraError::Config` if a variable is set but does not parse.
pub fn load_from_env() -> InfraResult<FetchguardConfig> {
    let config = apply_env_overrides(FetchguardConfig::default(), |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, probes the standard locations. Format is chosen by
/// extension (`.toml` or `.json`). The loaded config is validated.
///
/// # Errors
/// Returns `InfraError::Config` if no file is found, `Io` if it cannot be
/// read, and `Parse` if its contents are invalid.
pub fn load_from_file(path: Option<PathBuf>) -> InfraResult<FetchguardConfig> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(InfraError::Config(format!("Config file not found: {}", p.display())));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            InfraError::Config("No config file found in any of the standard locations".to_string())
        })?,
    };

    info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|source| InfraError::Io { path: config_path.clone(), source })?;

    let config = parse_config(&contents, &config_path)?;
    config.validate()?;
    Ok(config)
}

/// Parse configuration from string content, format chosen by extension
fn parse_config(contents: &str, path: &Path) -> InfraResult<FetchguardConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    let parse_error = |message: String| InfraError::Parse { path: path.to_path_buf(), message };

    match extension {
        "toml" => toml::from_str(contents).map_err(|e| parse_error(e.to_string())),
        "json" => serde_json::from_str(contents).map_err(|e| parse_error(e.to_string())),
        other => Err(InfraError::Config(format!("Unsupported config format: {other}"))),
    }
}

/// Probe the standard locations for a config file
///
/// # Returns
/// The first config file found, or `None` if no file exists.
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        dirs.extend([cwd.clone(), cwd.join(".."), cwd.join("../..")]);
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            dirs.extend([exe_dir.to_path_buf(), exe_dir.join("..")]);
        }
    }

    dirs.iter()
        .flat_map(|dir| FILE_NAMES.iter().map(move |name| dir.join(name)))
        .find(|path| path.exists())
}

/// Apply `FETCHGUARD_*` overrides read through `lookup`
pub(crate) fn apply_env_overrides<F>(
    mut config: FetchguardConfig,
    lookup: F,
) -> InfraResult<FetchguardConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.parse("FETCHGUARD_CACHE_MAX_ENTRIES")? {
        config.cache.max_entries = v;
    }
    if let Some(v) = env.millis("FETCHGUARD_CACHE_DEFAULT_TTL_MS")? {
        config.cache.default_ttl = v;
    }

    if let Some(v) = env.parse("FETCHGUARD_RETRY_MAX_ATTEMPTS")? {
        config.retry.max_attempts = v;
    }
    if let Some(v) = env.millis("FETCHGUARD_RETRY_BASE_DELAY_MS")? {
        config.retry.base_delay = v;
    }
    if let Some(v) = env.millis("FETCHGUARD_RETRY_MAX_DELAY_MS")? {
        config.retry.max_delay = v;
    }
    if let Some(v) = env.millis("FETCHGUARD_RETRY_RATE_LIMIT_FLOOR_MS")? {
        config.retry.rate_limit_floor = v;
    }
    if let Some(v) = env.millis("FETCHGUARD_RETRY_MAX_TOTAL_TIME_MS")? {
        config.retry.max_total_time = Some(v);
    }
    if let Some(v) = env.parse("FETCHGUARD_RETRY_BACKOFF_MULTIPLIER")? {
        config.retry.backoff_multiplier = v;
    }
    if let Some(v) = env.parse("FETCHGUARD_RETRY_JITTER_RATIO")? {
        config.retry.jitter_ratio = v;
    }

    if let Some(v) = env.parse("FETCHGUARD_BREAKER_FAILURE_THRESHOLD")? {
        config.circuit_breaker.failure_threshold = v;
    }
    if let Some(v) = env.parse("FETCHGUARD_BREAKER_EXPECTED_SUCCESSES")? {
        config.circuit_breaker.expected_successes = v;
    }
    if let Some(v) = env.parse("FETCHGUARD_BREAKER_RECOVERY_TIMEOUT_SECS")? {
        config.circuit_breaker.recovery_timeout = Duration::from_secs(v);
    }

    if let Some(v) = env.parse("FETCHGUARD_QUEUE_MAX_SIZE")? {
        config.queue.max_queue_size = v;
    }
    if let Some(v) = env.parse("FETCHGUARD_QUEUE_MAX_CONCURRENT")? {
        config.queue.max_concurrent = v;
    }
    if let Some(v) = env.millis("FETCHGUARD_QUEUE_SHUTDOWN_TIMEOUT_MS")? {
        config.queue.shutdown_timeout = v;
    }

    if let Some(level) = (env.lookup)("FETCHGUARD_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = env.flag("FETCHGUARD_LOG_JSON") {
        config.logging.json = json;
    }

    Ok(config)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &str) -> InfraResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| InfraError::Config(format!("Invalid value for {key}: {e}"))),
            None => Ok(None),
        }
    }

    fn millis(&self, key: &str) -> InfraResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    /// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off`
    /// (case-insensitive)
    fn flag(&self, key: &str) -> Option<bool> {
        (self.lookup)(key)
            .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }
}
