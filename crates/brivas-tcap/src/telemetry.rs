//! Tracing setup

use crate::config::LoggingConfig;
use crate::errors::{Result, TcapError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level. Fails instead of panicking
/// when a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TcapError::Config(format!("tracing init: {}", e)))?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TcapError::Config(format!("tracing init: {}", e)))?;
    }

    tracing::info!(
        log_level = %config.level,
        json_logs = config.json,
        "Tracing initialized"
    );

    Ok(())
}
