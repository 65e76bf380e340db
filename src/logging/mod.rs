// Logging module for structured logging using the tracing crate

use std::error::Error;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Build the level filter: `RUST_LOG` when set, otherwise the configured level
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter, Box<dyn Error>> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(&config.level)?),
    }
}

/// Initialize the tracing subscriber for structured logging
///
/// Output goes to stdout, either human-readable or as JSON lines for log
/// aggregation.
///
/// # Errors
///
/// Returns an error if the level directive does not parse or a global
/// subscriber is already installed.
///
/// # Examples
///
/// ```
/// use picshift::config::LogConfig;
/// use picshift::logging::init_subscriber;
///
/// init_subscriber(&LogConfig::default()).expect("Failed to initialize logging");
/// tracing::info!("Application started");
/// ```
pub fn init_subscriber(config: &LogConfig) -> Result<(), Box<dyn Error>> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json {
        builder
            .json()
            .with_current_span(false)
            .try_init()
            .map_err(|e| -> Box<dyn Error> { e })?;
    } else {
        builder.try_init().map_err(|e| -> Box<dyn Error> { e })?;
    }
    Ok(())
}
