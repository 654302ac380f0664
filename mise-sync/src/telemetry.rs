//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; binaries call
//! [`init_tracing`] once at startup.

use mise_core::{ConfigError, MiseResult, SyncError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter directive.
pub const LOG_FILTER_ENV: &str = "MISE_LOG";

/// Environment variable selecting the output format (`json` or `text`).
pub const LOG_FORMAT_ENV: &str = "MISE_LOG_FORMAT";

/// Logging configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive, e.g. `info,mise_sync=debug`.
    pub filter: String,
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: std::env::var(LOG_FILTER_ENV).unwrap_or_else(|_| "info".to_string()),
            json: std::env::var(LOG_FORMAT_ENV)
                .map(|s| s.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}

/// Install the global subscriber.
///
/// Fails if the filter directive does not parse or a global subscriber is
/// already set.
pub fn init_tracing(config: &TelemetryConfig) -> MiseResult<()> {
    let filter = EnvFilter::try_new(&config.filter).map_err(|e| ConfigError::InvalidValue {
        field: LOG_FILTER_ENV.to_string(),
        value: config.filter.clone(),
        reason: e.to_string(),
    })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    result.map_err(|e| SyncError::TelemetryInit {
        reason: e.to_string(),
    })?;
    Ok(())
}
