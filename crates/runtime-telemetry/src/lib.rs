//! # Runtime Telemetry
//!
//! Structured logging for hosts embedding `chain-runtime`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use runtime_telemetry::{init_logging, TelemetryConfig};
//!
//! let _guard = init_logging(&TelemetryConfig::from_env())?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CR_SERVICE_NAME` | `chain-runtime` | Service name in logs |
//! | `CR_LOG_LEVEL` | `info` | Log level filter (falls back to `RUST_LOG`) |
//! | `CR_CONSOLE_OUTPUT` | `true` | Emit logs to stdout |
//! | `CR_JSON_LOGS` | `false` | JSON lines instead of pretty output |

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;

pub use config::TelemetryConfig;

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The log filter directive could not be parsed.
    #[error("Invalid log filter '{directive}': {reason}")]
    InvalidFilter {
        /// Directive that failed to parse
        directive: String,
        /// Parser message
        reason: String,
    },

    /// A global subscriber is already installed for this process.
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Guard returned by [`init_logging`]. Logs a shutdown line when dropped.
pub struct LoggingGuard {
    service_name: String,
}

impl LoggingGuard {
    /// Service name this guard was installed for.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        tracing::info!(service = %self.service_name, "Shutting down logging");
    }
}

/// Build the env filter, preferring `RUST_LOG` directives when present.
pub fn build_filter(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::InvalidFilter {
            directive: config.log_level.clone(),
            reason: e.to_string(),
        })
}

/// Install the global tracing subscriber.
///
/// Returns a guard that should be held for the lifetime of the host.
pub fn init_logging(config: &TelemetryConfig) -> Result<LoggingGuard, TelemetryError> {
    let env_filter = build_filter(config)?;

    let installed = if !config.console_output {
        tracing_subscriber::registry().with(env_filter).try_init()
    } else if config.json_logs {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    };

    installed.map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        level = %config.log_level,
        json = config.json_logs,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        service_name: config.service_name.clone(),
    })
}
