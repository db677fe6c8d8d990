//! Subscriber installation.
//!
//! `RUST_LOG` wins over the configured filter so operators can raise the
//! level of a single run without editing the config file.

use tracing_subscriber::EnvFilter;

use crate::logging::{LogFormat, LoggingConfig};

/// Install the global fmt subscriber.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_with(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match config.format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}
