use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` reaches this through the
/// environment config source, so `config.level` is the single filter input.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("Invalid log filter: {}", config.level))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_current_span(false).with_target(true))
            .try_init(),
        "pretty" => registry.with(fmt::layer().pretty()).try_init(),
        "compact" => registry.with(fmt::layer().compact().with_target(false)).try_init(),
        other => return Err(anyhow::anyhow!("Unsupported log format: {}", other)),
    };

    result.context("Failed to install tracing subscriber")
}
