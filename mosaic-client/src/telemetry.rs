//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::ClientError;

/// Install the global subscriber. `RUST_LOG` overrides the configured filter.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ClientError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| ClientError::Telemetry(format!("Invalid log filter: {}", e)))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| ClientError::Telemetry(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(filter = %config.filter, json = config.json, "Tracing initialized");
    Ok(())
}
