//! Structured logging initialization.
//!
//! Thin wrapper over `tracing-subscriber`: console output by default,
//! `RUST_LOG`-style filtering via the env-filter, level floor taken from
//! [`LoggingConfig`](crate::config::LoggingConfig).

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber from a logging configuration.
///
/// Safe to call once per process; later calls are ignored (the first
/// subscriber wins), which keeps tests that share a process from panicking.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
