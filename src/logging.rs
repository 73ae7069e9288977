//! Logging setup
//!
//! Installs a layered subscriber:
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, else the configured level)
//!   └── Fmt Layer (pretty or JSON)
//! ```

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Logging errors
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{0}': {1}")]
    InvalidFilter(String, String),

    #[error("Unknown log format '{0}'")]
    UnknownFormat(String),

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    AlreadyInitialized(String),
}

/// Build the filter: `RUST_LOG` when set, otherwise `level`
pub fn env_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| LoggingError::InvalidFilter(level.to_string(), e.to_string()))
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = env_filter(&config.level)?;

    match config.format.as_str() {
        "json" => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_writer(std::io::stderr);

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer);

            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
        }
        "pretty" => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_writer(std::io::stderr);

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer);

            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
        }
        other => Err(LoggingError::UnknownFormat(other.to_string())),
    }
}
