//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! The filter comes from the `DAGGER_MASTER_LOG` environment variable when set
//! (any `EnvFilter` directive, e.g. `dagger_master::engine=debug`), otherwise
//! from the level passed in (usually `MasterConfig::log_level`).

use tracing_subscriber::{fmt, EnvFilter};

use crate::core::errors::{MasterError, Result};

pub const LOG_ENV: &str = "DAGGER_MASTER_LOG";

/// Install the global fmt subscriber writing to stderr.
///
/// Returns `Ok(false)` when a subscriber was already installed, so tests and
/// embedding applications can call it freely.
pub fn init_tracing(default_level: &str) -> Result<bool> {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives.trim()),
        _ => EnvFilter::try_new(default_level),
    }
    .map_err(|e| MasterError::configuration_field(format!("invalid log filter: {}", e), "log_level"))?;

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();

    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let _ = init_tracing("info").unwrap();
        assert!(!init_tracing("debug").unwrap());
    }
}
