//! Logging setup for LoRA Flow
//!
//! Installs the process-wide `tracing` subscriber. `RUST_LOG` takes
//! precedence over the configured default level.

use tracing_subscriber::{fmt, EnvFilter};

use common::error::{Error, Result};

/// Subscriber options
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Filter directive used when `RUST_LOG` is unset
    pub default_level: String,

    /// Emit JSON lines
    pub json: bool,

    /// Include the event target (module path)
    pub with_target: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            json: false,
            with_target: true,
        }
    }
}

/// Builds the filter from `RUST_LOG`, falling back to the default level
pub fn build_filter(default_level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_level)
            .map_err(|e| Error::Config(format!("invalid log level '{}': {}", default_level, e))),
    }
}

/// Initializes logging
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(options: &LogOptions) -> Result<()> {
    let filter = build_filter(&options.default_level)?;

    let result = if options.json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(options.with_target)
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(options.with_target)
            .try_init()
    };

    result.map_err(|e| Error::Config(format!("failed to install log subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_rejects_garbage() {
        if std::env::var("RUST_LOG").is_err() {
            assert!(build_filter("info,lora_flow=debug").is_ok());
            assert!(build_filter("lora_flow=loud").is_err());
        }
    }

    #[test]
    fn test_init_logging_twice_fails() {
        let options = LogOptions::default();
        let _ = init_logging(&options);

        // Only one global subscriber can ever be installed
        assert!(init_logging(&options).is_err());
    }
}
