//! # Inbound Ports
//!
//! API the runtime exposes to the binding layer of a host application.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::connection::{ConnectHandle, TypedApi};
use crate::domain::{
    ChainEvent, ConnectionState, EventFilter, NetworkConfig, QueryOptions, QueryResult,
    RuntimeResult,
};
use crate::events::EventSubscriptionScope;

/// Chain runtime API - inbound port.
#[async_trait]
pub trait ChainRuntimeApi: Send + Sync {
    /// Switch the active network. Awaiting the handle yields the typed API.
    fn connect(&self, network: NetworkConfig) -> ConnectHandle;

    /// Close the active connection and its event subscriptions.
    fn disconnect(&self);

    /// Current connection state.
    fn connection_status(&self) -> ConnectionState;

    /// Receiver notified on every connection state change.
    fn watch_connection_status(&self) -> watch::Receiver<ConnectionState>;

    /// The live typed API, connecting to the last selected network if needed.
    async fn typed_api(&self) -> RuntimeResult<TypedApi>;

    /// Cached storage read. `None` when the read failed.
    async fn query_storage(
        &self,
        section: &str,
        item: &str,
        params: serde_json::Value,
        options: QueryOptions,
    ) -> Option<serde_json::Value>;

    /// Current cache entry for `key`, or an idle placeholder.
    fn query_result(&self, key: &str) -> QueryResult;

    /// Drop one cached read.
    fn invalidate_query(&self, key: &str) -> bool;

    /// Drop every cached read.
    fn invalidate_all(&self);

    /// Record `(section, method)` events while the returned scope lives.
    async fn subscribe_events(
        &self,
        section: &str,
        method: &str,
    ) -> RuntimeResult<EventSubscriptionScope>;

    /// Logged events, newest first, optionally filtered.
    fn get_events(&self, filter: Option<&EventFilter>) -> Vec<ChainEvent>;

    /// Save successful cached reads. Returns the number saved.
    async fn persist_cache(&self) -> RuntimeResult<usize>;

    /// Rehydrate cached reads. Returns the number restored.
    async fn restore_cache(&self) -> RuntimeResult<usize>;
}
