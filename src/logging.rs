//! Tracing subscriber setup.
//!
//! Driven by the `[general]` section of [`HarvesterConfig`](crate::config::HarvesterConfig).
//! `RUST_LOG` takes precedence over the configured level.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::GeneralConfig;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("unknown log format '{0}', expected 'json' or 'pretty'")]
    UnknownFormat(String),

    #[error("failed to initialize tracing subscriber: {0}")]
    Init(String),
}

/// Installs the global subscriber.
///
/// Call once at process start; a second call fails with
/// [`LoggingError::Init`].
///
/// * `"json"`: one JSON object per line
/// * `"pretty"`: multi-line human-readable output
pub fn init_tracing(config: &GeneralConfig) -> Result<(), LoggingError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string())),
        "pretty" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string())),
        other => Err(LoggingError::UnknownFormat(other.to_owned())),
    }
}
