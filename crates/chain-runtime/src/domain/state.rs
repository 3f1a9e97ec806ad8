//! # Connection State
//!
//! Tagged state of the single managed connection.
//!
//! ```text
//!  Disconnected ──connect──► Connecting ──ok──► Connected
//!       ▲                        │                  │
//!       │                  retries exhausted        │
//!       │                        ▼                  │
//!       └──── disconnect / ─── Error ◄──────────────┘
//!             connect elsewhere
//! ```
//!
//! `Error` is not terminal: any new connect restarts the cycle.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::RuntimeError;

/// State of the runtime's connection. Exactly one value is live per runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no build in progress.
    #[default]
    Disconnected,
    /// A build for `network` is in progress.
    Connecting {
        /// Network being connected to
        network: String,
    },
    /// Connection to `network` is established.
    Connected {
        /// Network connected to
        network: String,
    },
    /// The last build for `network` failed.
    Error {
        /// Network whose build failed
        network: String,
        /// Failure that settled the build
        cause: RuntimeError,
    },
}

/// Status kind without payload, for compact display and serialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// See [`ConnectionState::Disconnected`]
    Disconnected,
    /// See [`ConnectionState::Connecting`]
    Connecting,
    /// See [`ConnectionState::Connected`]
    Connected,
    /// See [`ConnectionState::Error`]
    Error,
}

impl ConnectionState {
    /// Payload-free status kind.
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Disconnected => ConnectionStatus::Disconnected,
            Self::Connecting { .. } => ConnectionStatus::Connecting,
            Self::Connected { .. } => ConnectionStatus::Connected,
            Self::Error { .. } => ConnectionStatus::Error,
        }
    }

    /// Whether a connection is established.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Whether a build is in progress.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    /// Network this state refers to, if any.
    pub fn network(&self) -> Option<&str> {
        match self {
            Self::Disconnected => None,
            Self::Connecting { network }
            | Self::Connected { network }
            | Self::Error { network, .. } => Some(network),
        }
    }

    /// Failure cause when in the error state.
    pub fn error(&self) -> Option<&RuntimeError> {
        match self {
            Self::Error { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting { network } => write!(f, "connecting to {network}"),
            Self::Connected { network } => write!(f, "connected to {network}"),
            Self::Error { network, cause } => write!(f, "error on {network}: {cause}"),
        }
    }
}
