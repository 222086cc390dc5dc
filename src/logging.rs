//! Log subscriber setup for the binary.

use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Build the filter: `RUST_LOG` when set, else the configured level.
pub fn filter(config: &LogConfig) -> Result<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| anyhow!("Invalid log filter: {}", e))
}

/// Install the global subscriber. Call once at startup.
pub fn init(config: &LogConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(filter(config)?)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(config.ansi),
        )
        .try_init()
        .map_err(|e| anyhow!("Logging already initialized: {}", e))?;

    tracing::debug!(level = %config.level, "Logging initialized");
    Ok(())
}
