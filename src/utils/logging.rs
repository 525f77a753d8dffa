//! Structured logging setup.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! embedding application's call. `init_logging` is a convenience for binaries
//! and tests that want the configured defaults.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber built from `config`.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once is harmless: the second install is ignored.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.log_level.as_str().to_lowercase())
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid log filter: {e}")))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_ok() {
        tracing::debug!(app = %config.app_name, "Logging initialized");
    }
    Ok(())
}
