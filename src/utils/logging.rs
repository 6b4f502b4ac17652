//! Structured logging setup.
//!
//! Installs a global `tracing` subscriber from a [`LoggingConfig`]. `RUST_LOG`, when
//! set, overrides the configured level.

use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()))
}

/// Install the global subscriber.
///
/// File output takes precedence over console output when both are enabled. Calling
/// this twice is an error from the second call onward.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true);

    let installed = match (config.log_to_file, config.log_file_path.as_deref()) {
        (true, Some(path)) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file: {e}")))?;
            let builder = builder.with_writer(Mutex::new(file)).with_ansi(false);
            if config.json_format {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        _ if config.json_format => builder.json().try_init(),
        _ => builder.try_init(),
    };

    installed.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;
    tracing::info!(app = %config.app_name, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig::default();
        // another test may already have installed a subscriber
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
