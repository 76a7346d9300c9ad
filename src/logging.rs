//! Logging setup for binaries embedding the control plane.

#[cfg(feature = "logging")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(feature = "logging")]
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::ConfigError;

/// Installs a global `tracing` subscriber writing formatted events to
/// stderr.
///
/// `RUST_LOG` takes precedence over `filter` when it is set.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for a malformed `filter` and
/// [`ConfigError::Logging`] if a global subscriber is already installed.
#[cfg(feature = "logging")]
pub fn init_logging(filter: &str) -> Result<(), ConfigError> {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => tracing_subscriber::EnvFilter::try_new(filter).map_err(|e| ConfigError::Invalid {
            key: "log_filter".to_string(),
            message: e.to_string(),
        })?,
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))
}

/// Without the `logging` feature the embedding binary installs its own
/// subscriber and this does nothing.
///
/// # Errors
///
/// Never fails.
#[cfg(not(feature = "logging"))]
pub fn init_logging(_filter: &str) -> Result<(), ConfigError> {
    Ok(())
}
