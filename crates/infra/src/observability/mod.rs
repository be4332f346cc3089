//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events; the process installs one
//! subscriber at startup with [`init_tracing`].

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{InfraError, InfraResult};

/// Build the event filter: `RUST_LOG` when set, otherwise `config.level`
pub fn build_filter(config: &LoggingConfig) -> InfraResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            InfraError::Logging(format!("invalid log level {:?}: {e}", config.level))
        }),
    }
}

/// Install the global tracing subscriber
///
/// # Errors
/// Returns `InfraError::Logging` if the level directive is invalid or a
/// global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> InfraResult<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    installed.map_err(|e| InfraError::Logging(format!("failed to install subscriber: {e}")))?;

    tracing::info!(level = %config.level, json = config.json, "Tracing initialised");
    Ok(())
}
