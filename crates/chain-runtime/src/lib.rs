//! Chain Runtime - client-side connection, read cache and event log for a
//! remote blockchain node.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            ChainRuntime                              │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────┐  ┌───────────────────┐  ┌──────────────────┐  │
//! │  │ ConnectionManager │  │    QueryCache     │  │  EventRegistry   │  │
//! │  │ generation-gated  │  │ in-flight dedup   │  │ bounded log,     │  │
//! │  │ shared build,     │  │ TTL, eviction,    │  │ copy-on-write    │  │
//! │  │ retry + backoff   │  │ stale-while-error │  │ subscriptions    │  │
//! │  └─────────┬─────────┘  └─────────┬─────────┘  └────────┬─────────┘  │
//! │            │    typed_api()       │                      │            │
//! │            │◄─────────────────────┘                      │            │
//! │            │◄──────────── SubscriptionScopes (pumps) ────┘            │
//! └────────────┼─────────────────────────────────────────────────────────┘
//!              │
//!     ┌────────┴─────────┬──────────────────┬──────────────────┐
//!     ▼                  ▼                  ▼                  ▼
//! TransportFactory  DescriptorSource   SnapshotStore       TimeSource
//!  (WebSocket)       (static/file)       (file)             (system)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use chain_runtime::{ChainRuntime, FileDescriptorSource, NetworkConfig, QueryOptions};
//!
//! let runtime = ChainRuntime::builder()
//!     .config(RuntimeConfig::from_env()?)
//!     .descriptors(Arc::new(FileDescriptorSource::new("descriptors")))
//!     .build()?;
//!
//! runtime.connect(NetworkConfig::new("polkadot", "wss://rpc.polkadot.io", "polkadot")).await?;
//! let block = runtime.query_storage("System", "Number", json!([]), QueryOptions::new()).await;
//! let _scope = runtime.subscribe_events("Balances", "Transfer").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod application;
pub mod config;
pub mod connection;
pub mod domain;
pub mod events;
pub mod ports;
pub mod query;

// Re-exports for public API
pub use adapters::{
    FileDescriptorSource, FileSnapshotStore, StaticDescriptorSource, WsTransport,
    WsTransportFactory,
};
pub use application::{ChainRuntime, ChainRuntimeBuilder};
pub use config::{ConfigError, EventLogConfig, RuntimeConfig};
pub use connection::{ConnectHandle, ConnectionManager, DescriptorCache, RetryPolicy, TypedApi};
pub use domain::*;
pub use events::{EventRegistry, EventSubscriptionScope, SubscriptionScopes};
pub use ports::{ChainRuntimeApi, DescriptorSource, SnapshotStore, TimeSource, Transport, TransportFactory};
pub use query::{CacheStats, QueryCache};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
