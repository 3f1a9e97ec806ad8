//! # Runtime Configuration
//!
//! Cache policy, event log bound, connection retry policy and snapshot
//! location. Loaded from defaults, a TOML file or environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::connection::RetryPolicy;
use crate::domain::{CacheConfig, RuntimeError, DEFAULT_MAX_EVENTS};

/// Configuration loading and validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable held an unparsable value.
    #[error("Invalid value '{value}' for {var}")]
    InvalidEnv {
        /// Variable name
        var: String,
        /// Offending value
        value: String,
    },

    /// The TOML document could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// The config file could not be read.
    #[error("Failed to read config file {path}: {reason}")]
    Io {
        /// File path
        path: String,
        /// Underlying failure
        reason: String,
    },

    /// Values parsed but are not usable together.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for RuntimeError {
    fn from(e: ConfigError) -> Self {
        RuntimeError::Config(e.to_string())
    }
}

/// Event log settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventLogConfig {
    /// Events kept in the log.
    pub max_events: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

/// Complete runtime configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Query cache policy.
    pub cache: CacheConfig,
    /// Event log settings.
    pub events: EventLogConfig,
    /// Connection build retry policy.
    pub retry: RetryPolicy,
    /// Where a file snapshot store keeps the cache snapshot.
    pub snapshot_path: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Defaults overridden by environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CR_CACHE_TTL_MS`: Cache freshness window (default: 30000)
    /// - `CR_CACHE_MAX_SIZE`: Cache entry bound (default: 1000)
    /// - `CR_QUERY_TIMEOUT_MS`: Default read timeout (default: 180000)
    /// - `CR_MAX_EVENTS`: Event log bound (default: 100)
    /// - `CR_RETRY_MAX`: Connection build retries (default: 3)
    /// - `CR_SNAPSHOT_PATH`: Cache snapshot file (default: unset)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ttl_ms) = parse_var(&lookup, "CR_CACHE_TTL_MS")? {
            config.cache.ttl_ms = ttl_ms;
        }
        if let Some(max_size) = parse_var(&lookup, "CR_CACHE_MAX_SIZE")? {
            config.cache.max_size = max_size;
        }
        if let Some(timeout_ms) = parse_var(&lookup, "CR_QUERY_TIMEOUT_MS")? {
            config.cache.timeout_ms = timeout_ms;
        }
        if let Some(max_events) = parse_var(&lookup, "CR_MAX_EVENTS")? {
            config.events.max_events = max_events;
        }
        if let Some(max_retries) = parse_var(&lookup, "CR_RETRY_MAX")? {
            config.retry.max_retries = max_retries;
        }
        if let Some(path) = lookup("CR_SNAPSHOT_PATH").filter(|p| !p.trim().is_empty()) {
            config.snapshot_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document; missing fields take defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&source)
    }

    /// Short timeouts and no retry delay, for tests.
    pub fn for_testing() -> Self {
        Self {
            cache: CacheConfig {
                ttl_ms: 1_000,
                max_size: 50,
                timeout_ms: 2_000,
            },
            events: EventLogConfig { max_events: 10 },
            retry: RetryPolicy {
                max_retries: 3,
                base_delay_ms: 10,
                max_delay_ms: 100,
            },
            snapshot_path: None,
        }
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.retry
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
        })
}
