//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for runtime logging.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error) or a full directive
    pub log_level: String,

    /// Whether to enable console output
    pub console_output: bool,

    /// Whether to emit JSON formatted logs
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "chain-runtime".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CR_SERVICE_NAME`: Service name (default: chain-runtime)
    /// - `CR_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `CR_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `CR_JSON_LOGS`: Enable JSON logs (default: false, true in containers)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("CR_SERVICE_NAME")
                .unwrap_or_else(|_| "chain-runtime".to_string()),

            log_level: env::var("CR_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            console_output: env::var("CR_CONSOLE_OUTPUT")
                .map(|v| parse_flag(&v, true))
                .unwrap_or(true),

            json_logs: env::var("CR_JSON_LOGS")
                .map(|v| parse_flag(&v, false))
                .unwrap_or(is_container),
        }
    }

    /// Configuration for test hosts: debug level, no console noise.
    pub fn for_testing() -> Self {
        Self {
            service_name: "chain-runtime-test".to_string(),
            log_level: "debug".to_string(),
            console_output: false,
            json_logs: false,
        }
    }
}

/// Interpret a boolean-ish environment value, falling back to `default`
/// when the value is not recognised.
fn parse_flag(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "chain-runtime");
        assert_eq!(config.log_level, "info");
        assert!(config.console_output);
        assert!(!config.json_logs);
    }

    #[test]
    fn test_testing_config() {
        let config = TelemetryConfig::for_testing();
        assert_eq!(config.log_level, "debug");
        assert!(!config.console_output);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("TRUE", false));
        assert!(parse_flag("1", false));
        assert!(!parse_flag("off", true));
        assert!(parse_flag("garbage", true));
        assert!(!parse_flag("garbage", false));
    }
}
