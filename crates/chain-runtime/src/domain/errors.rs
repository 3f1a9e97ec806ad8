//! # Domain Errors
//!
//! Error taxonomy for the chain runtime.
//!
//! Every variant carries owned strings so a single settled result can be
//! cloned out to every task awaiting a shared connection build or a
//! coalesced query.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Chain runtime error types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// Network description or runtime configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Opening or using the transport to the node failed.
    #[error("Transport error on {endpoint}: {reason}")]
    Transport {
        /// Endpoint the transport was talking to
        endpoint: String,
        /// Underlying failure
        reason: String,
    },

    /// Loading chain descriptor metadata failed. Retryable.
    #[error("Descriptor load failed for '{key}': {reason}")]
    DescriptorLoad {
        /// Descriptor key being loaded
        key: String,
        /// Underlying failure
        reason: String,
    },

    /// No descriptor exists for the requested key.
    #[error("Unknown chain descriptor: {0}")]
    UnknownDescriptor(String),

    /// A read exceeded its configured timeout.
    #[error("Query '{key}' timed out after {after_ms}ms")]
    Timeout {
        /// Cache key of the read
        key: String,
        /// Timeout that elapsed, in milliseconds
        after_ms: u64,
    },

    /// A read function failed.
    #[error("Query failed: {0}")]
    Query(String),

    /// An underlying event stream failed.
    #[error("Subscription '{id}' failed: {reason}")]
    Subscription {
        /// Subscription id (`section:method`)
        id: String,
        /// Underlying failure
        reason: String,
    },

    /// No network has ever been selected.
    #[error("Not connected: no network selected")]
    NotConnected,

    /// The build was abandoned because a newer connect or a disconnect
    /// replaced it.
    #[error("Connection to '{0}' superseded before it was established")]
    Superseded(String),

    /// Reading or writing the cache snapshot failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// An event payload did not match the shape of its kind.
    #[error("Invalid event {section}.{method}: {reason}")]
    InvalidEvent {
        /// Event section (pallet)
        section: String,
        /// Event method (variant)
        method: String,
        /// Why decoding failed
        reason: String,
    },
}

impl RuntimeError {
    /// Build a transport error.
    pub fn transport(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a descriptor load error.
    pub fn descriptor_load(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::DescriptorLoad {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a query error from anything printable.
    pub fn query(reason: impl ToString) -> Self {
        Self::Query(reason.to_string())
    }

    /// Whether the connection build loop should retry after this error.
    ///
    /// Transient transport and descriptor failures are retried; bad
    /// configuration, missing descriptors and supersession are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::DescriptorLoad { .. })
    }

    /// Whether this error is a read timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Query(format!("serialization: {e}"))
    }
}
