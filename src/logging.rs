//! Tracing subscriber setup
//!
//! `RUST_LOG` wins over the configured level when set.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("Invalid log level: {}", config.level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
            .context("Failed to install JSON subscriber")?;
    } else {
        registry
            .with(fmt::layer().with_target(true))
            .try_init()
            .context("Failed to install subscriber")?;
    }
    Ok(())
}
