//! Tracing and logging setup shared by the scheduler binaries.

/// Initialize process-wide logging with the defaults (JSON, `RUST_LOG` or `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(&LoggingConfig::default());
}

/// Initialize process-wide logging from configuration.
pub fn init_with(config: &LoggingConfig) {
    tracing::init_with(config);
}

/// Logging configuration.
pub mod logging;

/// Subscriber installation.
pub mod tracing;

pub use logging::{LogFormat, LoggingConfig, ParseLogFormatError};
