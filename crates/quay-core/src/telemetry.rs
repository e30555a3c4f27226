//! Tracing subscriber setup for worker processes.

#[cfg(feature = "telemetry")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::QueueResult;
use serde::{Deserialize, Serialize};

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether to install a subscriber at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Filter directives used when `RUST_LOG` is not set.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_filter() -> String {
    "info,quay=debug".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            filter: default_filter(),
            json: false,
        }
    }
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over [`TelemetryConfig::filter`]. Calling this
/// twice is an error reported as [`crate::QueueError::Configuration`].
#[cfg(feature = "telemetry")]
pub fn init_tracing(config: &TelemetryConfig) -> QueueResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let result = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    result.map_err(|e| {
        crate::QueueError::Configuration(format!("Failed to install tracing subscriber: {}", e))
    })?;

    tracing::info!(json = config.json, filter = %config.filter, "Tracing initialized");

    Ok(())
}

/// Placeholder for when the telemetry feature is disabled.
#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_config: &TelemetryConfig) -> QueueResult<()> {
    Ok(())
}
