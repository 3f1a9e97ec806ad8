//! # Chain Runtime
//!
//! Application root tying the connection manager, the query cache and the
//! event registry together. Hosts build one runtime and hand out clones of
//! its `Arc` to every call site.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::adapters::{FileSnapshotStore, WsTransportFactory};
use crate::config::RuntimeConfig;
use crate::connection::{ConnectHandle, ConnectionManager, DescriptorCache, TypedApi};
use crate::domain::{
    ChainEvent, ConnectionState, EventFilter, NetworkConfig, QueryKey, QueryOptions, QueryResult,
    RuntimeError, RuntimeResult,
};
use crate::events::{EventRegistry, EventSubscriptionScope, SubscriptionScopes};
use crate::ports::{
    ChainRuntimeApi, DescriptorSource, SnapshotStore, SystemTimeSource, TimeSource,
    TransportFactory,
};
use crate::query::QueryCache;

/// Builder for [`ChainRuntime`].
pub struct ChainRuntimeBuilder {
    config: RuntimeConfig,
    transports: Option<Arc<dyn TransportFactory>>,
    descriptors: Option<Arc<dyn DescriptorSource>>,
    descriptor_cache: Option<Arc<DescriptorCache>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    clock: Arc<dyn TimeSource>,
}

impl Default for ChainRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: RuntimeConfig::default(),
            transports: None,
            descriptors: None,
            descriptor_cache: None,
            snapshots: None,
            clock: Arc::new(SystemTimeSource),
        }
    }
}

impl ChainRuntimeBuilder {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport factory. Defaults to [`WsTransportFactory`].
    pub fn transports(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Where chain descriptors come from. Required.
    pub fn descriptors(mut self, descriptors: Arc<dyn DescriptorSource>) -> Self {
        self.descriptors = Some(descriptors);
        self
    }

    /// Private descriptor cache. Defaults to [`DescriptorCache::global`].
    pub fn descriptor_cache(mut self, cache: Arc<DescriptorCache>) -> Self {
        self.descriptor_cache = Some(cache);
        self
    }

    /// Snapshot store. Defaults to a [`FileSnapshotStore`] when the config
    /// names a snapshot path.
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Clock stamping cache entries and events.
    pub fn time_source(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and assemble the runtime.
    pub fn build(self) -> RuntimeResult<ChainRuntime> {
        self.config.validate()?;

        let descriptors = self
            .descriptors
            .ok_or_else(|| RuntimeError::Config("no descriptor source configured".into()))?;
        let transports = self
            .transports
            .unwrap_or_else(|| Arc::new(WsTransportFactory::default()));
        let descriptor_cache = self.descriptor_cache.unwrap_or_else(DescriptorCache::global);

        let snapshots = self.snapshots.or_else(|| {
            self.config
                .snapshot_path
                .as_ref()
                .map(|path| Arc::new(FileSnapshotStore::new(path)) as Arc<dyn SnapshotStore>)
        });

        let connection = ConnectionManager::with_descriptor_cache(
            transports,
            descriptors,
            self.config.retry.clone(),
            descriptor_cache,
        );
        let cache = QueryCache::with_time_source(self.config.cache.clone(), Arc::clone(&self.clock))?;
        let events = Arc::new(EventRegistry::with_time_source(
            self.config.events.max_events,
            self.clock,
        ));

        Ok(ChainRuntime {
            config: self.config,
            connection,
            cache,
            events,
            scopes: SubscriptionScopes::new(),
            snapshots,
        })
    }
}

/// The runtime: one connection, one read cache, one event log.
pub struct ChainRuntime {
    config: RuntimeConfig,
    connection: ConnectionManager,
    cache: QueryCache,
    events: Arc<EventRegistry>,
    scopes: SubscriptionScopes,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl fmt::Debug for ChainRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainRuntime")
            .field("connection", &self.connection)
            .field("cached", &self.cache.len())
            .field("events", &self.events.len())
            .field("subscriptions", &self.scopes.len())
            .finish()
    }
}

impl ChainRuntime {
    /// Start building a runtime.
    pub fn builder() -> ChainRuntimeBuilder {
        ChainRuntimeBuilder::default()
    }

    /// Switch to `network`.
    ///
    /// Event subscriptions belong to the connection they were opened on and
    /// are torn down. Cached reads are dropped when the network changes.
    pub fn connect(&self, network: NetworkConfig) -> ConnectHandle {
        self.teardown_subscriptions();

        let changed = self
            .connection
            .current_network()
            .is_some_and(|current| current != network);
        if changed {
            info!(network = %network.name, "network changed, invalidating cached reads");
            self.cache.invalidate_all();
        }

        self.connection.connect(network)
    }

    /// Close the connection and every event subscription.
    pub fn disconnect(&self) {
        self.teardown_subscriptions();
        self.connection.disconnect();
    }

    /// Current connection state.
    pub fn status(&self) -> ConnectionState {
        self.connection.status()
    }

    /// Receiver notified on every connection state change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_status()
    }

    /// The live typed API, connecting if needed.
    pub async fn typed_api(&self) -> RuntimeResult<TypedApi> {
        self.connection.typed_api().await
    }

    /// Cached read of storage item `section.item` with `params`.
    ///
    /// Resolves to `None` when the read fails; the error is kept in
    /// [`ChainRuntime::query_result`].
    pub async fn query_storage(
        &self,
        section: &str,
        item: &str,
        params: serde_json::Value,
        options: QueryOptions,
    ) -> Option<serde_json::Value> {
        let key = QueryKey::storage(section, item, &params);
        let connection = self.connection.clone();
        let (section, item) = (section.to_string(), item.to_string());

        self.cache
            .execute_query(
                key,
                move || async move {
                    let api = connection.typed_api().await?;
                    api.query_storage(&section, &item, params).await
                },
                options,
            )
            .await
    }

    /// Typed variant of [`ChainRuntime::query_storage`].
    pub async fn query_storage_as<T>(
        &self,
        section: &str,
        item: &str,
        params: serde_json::Value,
        options: QueryOptions,
    ) -> Option<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let key = QueryKey::storage(section, item, &params);
        let connection = self.connection.clone();
        let (section, item) = (section.to_string(), item.to_string());

        self.cache
            .execute_query_as(
                key,
                move || async move {
                    let api = connection.typed_api().await?;
                    let value = api.query_storage(&section, &item, params).await?;
                    Ok(serde_json::from_value(value)?)
                },
                options,
            )
            .await
    }

    /// Current cache entry for `key`.
    pub fn query_result(&self, key: &str) -> QueryResult {
        self.cache.get_query_result(key)
    }

    /// Record `(section, method)` events while the returned scope lives.
    pub async fn subscribe_events(
        &self,
        section: &str,
        method: &str,
    ) -> RuntimeResult<EventSubscriptionScope> {
        let api = self.connection.typed_api().await?;
        self.scopes.acquire(&self.events, &api, section, method).await
    }

    /// Logged events, newest first.
    pub fn get_events(&self, filter: Option<&EventFilter>) -> Vec<ChainEvent> {
        self.events.get_events(filter)
    }

    /// Save cached reads through the snapshot store.
    pub async fn persist_cache(&self) -> RuntimeResult<usize> {
        let store = self.snapshot_store()?;
        self.cache.persist(store.as_ref()).await
    }

    /// Rehydrate cached reads from the snapshot store.
    pub async fn restore_cache(&self) -> RuntimeResult<usize> {
        let store = self.snapshot_store()?;
        self.cache.restore(store.as_ref()).await
    }

    /// Configuration the runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Connection manager.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Query cache.
    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Event registry.
    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    fn snapshot_store(&self) -> RuntimeResult<&Arc<dyn SnapshotStore>> {
        self.snapshots
            .as_ref()
            .ok_or_else(|| RuntimeError::Persistence("no snapshot store configured".into()))
    }

    fn teardown_subscriptions(&self) {
        if !self.scopes.is_empty() {
            debug!(count = self.scopes.len(), "tearing down event subscriptions");
        }
        self.scopes.abort_all();
        self.events.clear_subscriptions();
    }
}

#[async_trait]
impl ChainRuntimeApi for ChainRuntime {
    fn connect(&self, network: NetworkConfig) -> ConnectHandle {
        ChainRuntime::connect(self, network)
    }

    fn disconnect(&self) {
        ChainRuntime::disconnect(self)
    }

    fn connection_status(&self) -> ConnectionState {
        self.status()
    }

    fn watch_connection_status(&self) -> watch::Receiver<ConnectionState> {
        self.watch_status()
    }

    async fn typed_api(&self) -> RuntimeResult<TypedApi> {
        ChainRuntime::typed_api(self).await
    }

    async fn query_storage(
        &self,
        section: &str,
        item: &str,
        params: serde_json::Value,
        options: QueryOptions,
    ) -> Option<serde_json::Value> {
        ChainRuntime::query_storage(self, section, item, params, options).await
    }

    fn query_result(&self, key: &str) -> QueryResult {
        ChainRuntime::query_result(self, key)
    }

    fn invalidate_query(&self, key: &str) -> bool {
        self.cache.invalidate_query(key)
    }

    fn invalidate_all(&self) {
        self.cache.invalidate_all()
    }

    async fn subscribe_events(
        &self,
        section: &str,
        method: &str,
    ) -> RuntimeResult<EventSubscriptionScope> {
        ChainRuntime::subscribe_events(self, section, method).await
    }

    fn get_events(&self, filter: Option<&EventFilter>) -> Vec<ChainEvent> {
        ChainRuntime::get_events(self, filter)
    }

    async fn persist_cache(&self) -> RuntimeResult<usize> {
        ChainRuntime::persist_cache(self).await
    }

    async fn restore_cache(&self) -> RuntimeResult<usize> {
        ChainRuntime::restore_cache(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::STORAGE_METHOD;
    use crate::domain::{ChainDescriptor, PalletDescriptor, QueryStatus};
    use crate::ports::{InMemorySnapshotStore, MockDescriptorSource, MockTransportFactory};
    use serde_json::json;
    use std::time::Duration;

    const ALPHA: &str = "ws://alpha.local";
    const BETA: &str = "ws://beta.local";

    struct Fixture {
        runtime: ChainRuntime,
        transports: Arc<MockTransportFactory>,
        snapshots: Arc<InMemorySnapshotStore>,
    }

    fn descriptor(key: &str) -> ChainDescriptor {
        ChainDescriptor::new(key).with_pallet(
            PalletDescriptor::new("System")
                .storage(["Number", "Account"])
                .events(["ExtrinsicSuccess"]),
        )
    }

    fn fixture() -> Fixture {
        let transports = Arc::new(MockTransportFactory::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let descriptors = MockDescriptorSource::new()
            .with_descriptor(descriptor("alpha"))
            .with_descriptor(descriptor("beta"));

        let runtime = ChainRuntime::builder()
            .config(RuntimeConfig::for_testing())
            .transports(transports.clone())
            .descriptors(Arc::new(descriptors))
            .descriptor_cache(Arc::new(DescriptorCache::new()))
            .snapshot_store(snapshots.clone())
            .build()
            .unwrap();

        Fixture {
            runtime,
            transports,
            snapshots,
        }
    }

    fn alpha() -> NetworkConfig {
        NetworkConfig::new("alpha", ALPHA, "alpha")
    }

    fn beta() -> NetworkConfig {
        NetworkConfig::new("beta", BETA, "beta")
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_build_requires_descriptor_source() {
        let result = ChainRuntime::builder().build();
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = RuntimeConfig::for_testing();
        config.cache.max_size = 0;

        let result = ChainRuntime::builder()
            .config(config)
            .descriptors(Arc::new(MockDescriptorSource::new()))
            .build();
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[tokio::test]
    async fn test_query_storage_is_cached() {
        let f = fixture();
        let node = f.transports.node(ALPHA);
        node.set_response(STORAGE_METHOD, json!(100));

        f.runtime.connect(alpha()).await.unwrap();

        let first = f
            .runtime
            .query_storage("System", "Number", json!([]), QueryOptions::new())
            .await;
        let second = f
            .runtime
            .query_storage("System", "Number", json!([]), QueryOptions::new())
            .await;

        assert_eq!(first, Some(json!(100)));
        assert_eq!(second, Some(json!(100)));
        assert_eq!(node.request_count(), 1);

        let key = QueryKey::storage("System", "Number", &json!([]));
        assert_eq!(f.runtime.query_result(&key).status, QueryStatus::Success);
    }

    #[tokio::test]
    async fn test_query_storage_connects_lazily() {
        let f = fixture();
        f.transports.node(ALPHA).set_response(STORAGE_METHOD, json!(7));

        f.runtime.connect(alpha()).cancel();
        f.runtime.disconnect();

        let value: Option<u64> = f
            .runtime
            .query_storage_as("System", "Number", json!([]), QueryOptions::new())
            .await;

        assert_eq!(value, Some(7));
        assert!(f.runtime.status().is_connected());
    }

    #[tokio::test]
    async fn test_query_failure_keeps_error() {
        let f = fixture();
        f.transports
            .node(ALPHA)
            .set_failure(STORAGE_METHOD, "storage unavailable");
        f.runtime.connect(alpha()).await.unwrap();

        let value = f
            .runtime
            .query_storage("System", "Number", json!([]), QueryOptions::new())
            .await;

        assert!(value.is_none());
        let key = QueryKey::storage("System", "Number", &json!([]));
        let entry = f.runtime.query_result(&key);
        assert_eq!(entry.status, QueryStatus::Error);
        assert!(entry.error.unwrap().to_string().contains("storage unavailable"));
    }

    #[tokio::test]
    async fn test_network_switch_invalidates_cache() {
        let f = fixture();
        f.transports.node(ALPHA).set_response(STORAGE_METHOD, json!("alpha"));
        f.transports.node(BETA).set_response(STORAGE_METHOD, json!("beta"));

        f.runtime.connect(alpha()).await.unwrap();
        f.runtime
            .query_storage("System", "Number", json!([]), QueryOptions::new())
            .await;
        assert_eq!(f.runtime.cache().len(), 1);

        f.runtime.connect(beta()).await.unwrap();
        assert!(f.runtime.cache().is_empty());

        let value = f
            .runtime
            .query_storage("System", "Number", json!([]), QueryOptions::new())
            .await;
        assert_eq!(value, Some(json!("beta")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_during_slow_read_serves_new_network() {
        let f = fixture();
        let alpha_node = f.transports.node(ALPHA);
        alpha_node.set_response(STORAGE_METHOD, json!("alpha"));
        alpha_node.set_latency(Duration::from_millis(500));
        f.transports.node(BETA).set_response(STORAGE_METHOD, json!("beta"));
        let runtime = Arc::new(f.runtime);
        let key = QueryKey::storage("System", "Number", &json!([]));

        runtime.connect(alpha()).await.unwrap();
        let slow = tokio::spawn({
            let runtime = runtime.clone();
            async move {
                runtime
                    .query_storage("System", "Number", json!([]), QueryOptions::new())
                    .await
            }
        });
        settle().await;
        assert!(runtime.cache().is_in_flight(&key));

        runtime.connect(beta()).await.unwrap();
        let value = runtime
            .query_storage("System", "Number", json!([]), QueryOptions::new())
            .await;
        assert_eq!(value, Some(json!("beta")));

        // alpha's transport was closed by the switch
        assert_eq!(slow.await.unwrap(), None);
        let entry = runtime.query_result(&key);
        assert_eq!(entry.status, QueryStatus::Success);
        assert_eq!(entry.data, Some(json!("beta")));
        assert!(entry.error.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_same_network_keeps_cache() {
        let f = fixture();
        f.transports.node(ALPHA).set_response(STORAGE_METHOD, json!(1));

        f.runtime.connect(alpha()).await.unwrap();
        f.runtime
            .query_storage("System", "Number", json!([]), QueryOptions::new())
            .await;

        f.runtime.connect(alpha()).await.unwrap();
        assert_eq!(f.runtime.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_events_records_and_disconnect_tears_down() {
        let f = fixture();
        let node = f.transports.node(ALPHA);
        f.runtime.connect(alpha()).await.unwrap();

        let scope = f
            .runtime
            .subscribe_events("System", "ExtrinsicSuccess")
            .await
            .unwrap();
        node.emit(json!({
            "section": "System",
            "method": "ExtrinsicSuccess",
            "data": {},
            "blockNumber": 3,
            "index": 1
        }));
        settle().await;

        assert_eq!(f.runtime.get_events(None).len(), 1);
        assert!(scope.is_active());

        f.runtime.disconnect();
        assert!(f.runtime.events().subscriptions().is_empty());
        assert!(!scope.is_active());
        assert_eq!(f.runtime.get_events(None).len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_without_network_fails() {
        let f = fixture();
        let result = f.runtime.subscribe_events("System", "ExtrinsicSuccess").await;
        assert!(matches!(result, Err(RuntimeError::NotConnected)));
    }

    #[tokio::test]
    async fn test_persist_and_restore_cache() {
        let f = fixture();
        f.transports.node(ALPHA).set_response(STORAGE_METHOD, json!(5));
        f.runtime.connect(alpha()).await.unwrap();
        f.runtime
            .query_storage("System", "Number", json!([]), QueryOptions::new())
            .await;

        assert_eq!(f.runtime.persist_cache().await.unwrap(), 1);
        assert_eq!(f.snapshots.save_count(), 1);

        f.runtime.cache().invalidate_all();
        assert_eq!(f.runtime.restore_cache().await.unwrap(), 1);

        let key = QueryKey::storage("System", "Number", &json!([]));
        assert_eq!(f.runtime.query_result(&key).data, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_persist_without_store() {
        let runtime = ChainRuntime::builder()
            .config(RuntimeConfig::for_testing())
            .transports(Arc::new(MockTransportFactory::new()))
            .descriptors(Arc::new(MockDescriptorSource::new()))
            .build()
            .unwrap();

        assert!(matches!(
            runtime.persist_cache().await,
            Err(RuntimeError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_runtime_through_inbound_port() {
        let f = fixture();
        f.transports.node(ALPHA).set_response(STORAGE_METHOD, json!(9));
        let api: &dyn ChainRuntimeApi = &f.runtime;

        api.connect(alpha()).await.unwrap();
        assert!(api.connection_status().is_connected());
        assert_eq!(
            api.query_storage("System", "Number", json!([]), QueryOptions::new())
                .await,
            Some(json!(9))
        );

        let key = QueryKey::storage("System", "Number", &json!([]));
        assert!(api.invalidate_query(&key));
        assert_eq!(api.query_result(&key).status, QueryStatus::Idle);
    }
}
