//! Structured logging initialization.

use crate::config::LoggingConfig;
use crate::error::{Result, TradeError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| TradeError::Config(format!("Invalid log level {}: {}", config.level, e)))?;

    let initialized = match config.format.as_deref() {
        Some("pretty") => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(true).with_thread_names(true))
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true).with_span_list(true))
            .try_init(),
    };

    initialized.map_err(|e| TradeError::Config(format!("Failed to install log subscriber: {}", e)))
}
