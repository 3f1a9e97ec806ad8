//! # Connection Manager
//!
//! Owns the single active connection of a runtime and drives its state
//! machine.
//!
//! ## Build Pipeline
//!
//! ```text
//! connect(network)
//!     │
//!     ├─ validate network ──────────────── fail ──► Error (no retry)
//!     │
//!     ├─ (a) open transport ───┐
//!     ├─ (b) load descriptor   ├─ retryable failure ──► sleep(backoff) ──┐
//!     ├─ (c) derive TypedApi ──┘                                         │
//!     │        ▲                                                         │
//!     │        └─────────────────────────────────────────────────────────┘
//!     │
//!     └─ still current? ── no ──► close, settle as Superseded
//!              │
//!             yes ──► Connected
//! ```
//!
//! Every connect bumps a generation counter. A build only commits if its
//! generation is still the latest, so rapid switches between networks
//! always end on the last one requested.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;

use super::descriptor_cache::DescriptorCache;
use super::retry::RetryPolicy;
use super::typed_api::TypedApi;
use crate::domain::{ConnectionState, NetworkConfig, RuntimeError, RuntimeResult};
use crate::ports::{DescriptorSource, TransportFactory};

type SharedBuild = Shared<BoxFuture<'static, RuntimeResult<TypedApi>>>;

struct ManagerInner {
    transports: Arc<dyn TransportFactory>,
    descriptors: Arc<dyn DescriptorSource>,
    descriptor_cache: Arc<DescriptorCache>,
    retry: RetryPolicy,
    state: watch::Sender<ConnectionState>,
    slot: Mutex<ConnectionSlot>,
}

#[derive(Default)]
struct ConnectionSlot {
    generation: u64,
    network: Option<NetworkConfig>,
    api: Option<TypedApi>,
    pending: Option<SharedBuild>,
}

enum Current {
    Ready(TypedApi),
    Pending(SharedBuild),
}

/// Manages the runtime's one connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &*self.inner.state.borrow())
            .field("retry", &self.inner.retry)
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager using the process-wide descriptor cache.
    pub fn new(
        transports: Arc<dyn TransportFactory>,
        descriptors: Arc<dyn DescriptorSource>,
        retry: RetryPolicy,
    ) -> Self {
        Self::with_descriptor_cache(transports, descriptors, retry, DescriptorCache::global())
    }

    /// Create a manager with its own descriptor cache.
    pub fn with_descriptor_cache(
        transports: Arc<dyn TransportFactory>,
        descriptors: Arc<dyn DescriptorSource>,
        retry: RetryPolicy,
        descriptor_cache: Arc<DescriptorCache>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ManagerInner {
                transports,
                descriptors,
                descriptor_cache,
                retry,
                state,
                slot: Mutex::new(ConnectionSlot::default()),
            }),
        }
    }

    /// Switch to `network`.
    ///
    /// Tears down any existing connection, supersedes any build in flight and
    /// starts a new one. The build is driven in the background when called
    /// inside a Tokio runtime; otherwise it runs when the handle is awaited.
    pub fn connect(&self, network: NetworkConfig) -> ConnectHandle {
        let (stale, handle) = {
            let mut slot = self.inner.slot.lock();
            self.inner.begin(&mut slot, network)
        };

        if let Some(api) = stale {
            debug!(network = api.network(), "closing previous connection");
            api.close();
        }
        handle
    }

    /// Destroy the active connection and any build in flight.
    ///
    /// The selected network is remembered, so a later
    /// [`ConnectionManager::typed_api`] reconnects to it.
    pub fn disconnect(&self) {
        let stale = {
            let mut slot = self.inner.slot.lock();
            slot.generation += 1;
            slot.pending = None;
            self.inner.state.send_replace(ConnectionState::Disconnected);
            slot.api.take()
        };

        if let Some(api) = stale {
            api.close();
            info!(network = api.network(), "disconnected");
        }
    }

    /// The live typed API.
    ///
    /// Resolves immediately when connected, joins the build in flight when
    /// connecting, and otherwise reconnects to the last selected network.
    /// A connection whose transport was closed by the peer is rebuilt.
    pub async fn typed_api(&self) -> RuntimeResult<TypedApi> {
        let mut build = {
            let mut slot = self.inner.slot.lock();
            match &slot.api {
                Some(api) if !api.is_closed() => return Ok(api.clone()),
                Some(api) => {
                    warn!(network = api.network(), "transport closed by peer, reconnecting");
                }
                None => {}
            }
            if let Some(build) = slot.pending.clone() {
                build
            } else {
                let network = slot.network.clone().ok_or(RuntimeError::NotConnected)?;
                let (_, handle) = self.inner.begin(&mut slot, network);
                handle.build
            }
        };

        loop {
            match build.await {
                Err(RuntimeError::Superseded(name)) => match self.inner.current() {
                    Some(Current::Ready(api)) => return Ok(api),
                    Some(Current::Pending(next)) => build = next,
                    None => return Err(RuntimeError::Superseded(name)),
                },
                settled => return settled,
            }
        }
    }

    /// Current connection state.
    pub fn status(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether a connection is established.
    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().is_connected()
    }

    /// Last network selected by `connect`.
    pub fn current_network(&self) -> Option<NetworkConfig> {
        self.inner.slot.lock().network.clone()
    }

    /// Descriptor cache backing this manager.
    pub fn descriptor_cache(&self) -> &Arc<DescriptorCache> {
        &self.inner.descriptor_cache
    }

    /// Retry policy of connection builds.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }
}

impl ManagerInner {
    fn begin(
        self: &Arc<Self>,
        slot: &mut ConnectionSlot,
        network: NetworkConfig,
    ) -> (Option<TypedApi>, ConnectHandle) {
        slot.generation += 1;
        let generation = slot.generation;

        let stale = slot.api.take();
        if slot.pending.take().is_some() {
            debug!(generation, "superseding connection build in flight");
        }

        let was_error = self.state.borrow().error().is_some();
        if stale.is_some() || was_error {
            self.state.send_replace(ConnectionState::Disconnected);
        }

        info!(network = %network.name, endpoint = %network.endpoint, generation, "connecting");
        self.state.send_replace(ConnectionState::Connecting {
            network: network.name.clone(),
        });

        let build = Self::start_build(Arc::downgrade(self), network.clone(), generation);
        slot.network = Some(network.clone());
        slot.pending = Some(build.clone());

        let handle = ConnectHandle {
            network,
            generation,
            build,
            manager: Arc::downgrade(self),
        };
        (stale, handle)
    }

    fn start_build(manager: Weak<Self>, network: NetworkConfig, generation: u64) -> SharedBuild {
        let build = async move {
            let Some(inner) = manager.upgrade() else {
                return Err(RuntimeError::Superseded(network.name));
            };
            let outcome = inner.build_with_retry(&network, generation).await;
            inner.settle(&network, generation, outcome)
        }
        .boxed()
        .shared();

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(build.clone());
        }
        build
    }

    async fn build_with_retry(
        &self,
        network: &NetworkConfig,
        generation: u64,
    ) -> RuntimeResult<TypedApi> {
        let endpoint = network.validate()?;
        let mut attempt = 0u32;

        loop {
            self.ensure_current(network, generation)?;

            match self.build_once(network, &endpoint, generation).await {
                Ok(api) => return Ok(api),
                Err(e) if self.retry.should_retry(attempt, &e) => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        network = %network.name,
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn build_once(
        &self,
        network: &NetworkConfig,
        endpoint: &Url,
        generation: u64,
    ) -> RuntimeResult<TypedApi> {
        let transport = self.transports.open(endpoint).await?;

        let derived = async {
            self.ensure_current(network, generation)?;
            let descriptor = self
                .descriptor_cache
                .get_or_load(&network.descriptor_key, Arc::clone(&self.descriptors))
                .await?;
            self.ensure_current(network, generation)?;
            TypedApi::derive(network, Arc::clone(&transport), descriptor)
        }
        .await;

        if derived.is_err() {
            transport.close();
        }
        derived
    }

    fn ensure_current(&self, network: &NetworkConfig, generation: u64) -> RuntimeResult<()> {
        if self.slot.lock().generation == generation {
            Ok(())
        } else {
            Err(RuntimeError::Superseded(network.name.clone()))
        }
    }

    fn settle(
        &self,
        network: &NetworkConfig,
        generation: u64,
        outcome: RuntimeResult<TypedApi>,
    ) -> RuntimeResult<TypedApi> {
        let mut slot = self.slot.lock();

        if slot.generation != generation {
            if let Ok(api) = &outcome {
                api.close();
            }
            debug!(network = %network.name, generation, "discarding superseded connection build");
            return Err(RuntimeError::Superseded(network.name.clone()));
        }

        slot.pending = None;
        match outcome {
            Ok(api) => {
                slot.api = Some(api.clone());
                self.state.send_replace(ConnectionState::Connected {
                    network: network.name.clone(),
                });
                info!(network = %network.name, endpoint = api.endpoint(), "connected");
                Ok(api)
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Error {
                    network: network.name.clone(),
                    cause: e.clone(),
                });
                error!(network = %network.name, error = %e, "connection failed");
                Err(e)
            }
        }
    }

    fn cancel(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock();
        if slot.generation != generation || slot.pending.is_none() {
            return false;
        }

        slot.generation += 1;
        slot.pending = None;
        self.state.send_replace(ConnectionState::Disconnected);
        info!(generation, "connection build cancelled");
        true
    }

    fn current(&self) -> Option<Current> {
        let slot = self.slot.lock();
        if let Some(api) = &slot.api {
            return Some(Current::Ready(api.clone()));
        }
        slot.pending.clone().map(Current::Pending)
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(api) = self.slot.get_mut().api.take() {
            api.close();
        }
    }
}

/// Handle to one connect request.
///
/// Awaiting it yields the typed API, or [`RuntimeError::Superseded`] when a
/// later connect or a disconnect replaced this build. Dropping it does not
/// cancel anything.
pub struct ConnectHandle {
    network: NetworkConfig,
    generation: u64,
    build: SharedBuild,
    manager: Weak<ManagerInner>,
}

impl fmt::Debug for ConnectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectHandle")
            .field("network", &self.network.name)
            .field("generation", &self.generation)
            .finish()
    }
}

impl ConnectHandle {
    /// Network this request targets.
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    /// Whether this request is still the latest one.
    pub fn is_current(&self) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|m| m.slot.lock().generation == self.generation)
    }

    /// Abort the build if it is still in flight. Returns whether anything was
    /// cancelled; an established connection is left alone.
    pub fn cancel(&self) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|m| m.cancel(self.generation))
    }

    /// Await the outcome without consuming the handle.
    pub async fn wait(&self) -> RuntimeResult<TypedApi> {
        self.build.clone().await
    }
}

impl IntoFuture for ConnectHandle {
    type Output = RuntimeResult<TypedApi>;
    type IntoFuture = SharedBuild;

    fn into_future(self) -> Self::IntoFuture {
        self.build
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChainDescriptor, ConnectionStatus};
    use crate::ports::{MockDescriptorSource, MockTransportFactory, Transport};
    use std::time::Duration;

    struct Fixture {
        manager: ConnectionManager,
        transports: Arc<MockTransportFactory>,
        descriptors: Arc<MockDescriptorSource>,
    }

    fn fixture() -> Fixture {
        let transports = Arc::new(MockTransportFactory::new());
        let descriptors = Arc::new(
            MockDescriptorSource::new()
                .with_descriptor(ChainDescriptor::new("dot"))
                .with_descriptor(ChainDescriptor::new("ksm")),
        );
        let manager = ConnectionManager::with_descriptor_cache(
            transports.clone(),
            descriptors.clone(),
            RetryPolicy::default(),
            Arc::new(DescriptorCache::new()),
        );
        Fixture {
            manager,
            transports,
            descriptors,
        }
    }

    fn polkadot() -> NetworkConfig {
        NetworkConfig::new("polkadot", "wss://polkadot.example", "dot")
    }

    fn kusama() -> NetworkConfig {
        NetworkConfig::new("kusama", "wss://kusama.example", "ksm")
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let f = fixture();
        let mut status = f.manager.watch_status();

        let api = f.manager.connect(polkadot()).await.unwrap();

        assert_eq!(api.network(), "polkadot");
        assert!(f.manager.is_connected());
        assert_eq!(
            status.borrow_and_update().status(),
            ConnectionStatus::Connected
        );
        assert_eq!(f.transports.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_connect_wins() {
        let f = fixture();
        f.transports
            .set_delay("wss://polkadot.example", Duration::from_millis(500));

        let first = f.manager.connect(polkadot());
        let second = f.manager.connect(kusama());

        assert!(!first.is_current());
        assert!(second.is_current());

        let api = second.await.unwrap();
        assert_eq!(api.network(), "kusama");

        assert!(matches!(
            first.wait().await,
            Err(RuntimeError::Superseded(name)) if name == "polkadot"
        ));
        assert_eq!(
            f.manager.status(),
            ConnectionState::Connected {
                network: "kusama".into()
            }
        );

        // polkadot's late transport was opened and then released
        tokio::time::sleep(Duration::from_secs(1)).await;
        let opened = f.transports.opened();
        assert!(opened
            .iter()
            .filter(|t| t.endpoint().contains("polkadot"))
            .all(|t| t.is_closed()));
    }

    #[tokio::test]
    async fn test_switching_closes_previous_transport() {
        let f = fixture();
        f.manager.connect(polkadot()).await.unwrap();
        f.manager.connect(kusama()).await.unwrap();

        let opened = f.transports.opened();
        assert_eq!(opened.len(), 2);
        assert!(opened[0].is_closed());
        assert!(!opened[1].is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let f = fixture();
        f.transports.fail_next_opens(3);

        let api = f.manager.connect(polkadot()).await.unwrap();

        assert_eq!(api.network(), "polkadot");
        assert_eq!(f.transports.open_count(), 4);
        assert!(f.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_end_in_error() {
        let f = fixture();
        f.transports.fail_next_opens(10);

        let result = f.manager.connect(polkadot()).await;

        assert!(matches!(result, Err(RuntimeError::Transport { .. })));
        assert_eq!(f.transports.open_count(), 4);
        assert_eq!(f.manager.status().status(), ConnectionStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_descriptor_failures_are_retried() {
        let f = fixture();
        f.descriptors.fail_next_loads(2);

        assert!(f.manager.connect(polkadot()).await.is_ok());
        assert_eq!(f.descriptors.load_count(), 3);
        // each failed attempt released its transport
        let opened = f.transports.opened();
        assert_eq!(opened.iter().filter(|t| t.is_closed()).count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_descriptor_is_not_retried() {
        let f = fixture();
        let network = NetworkConfig::new("westend", "wss://westend.example", "wnd");

        let result = f.manager.connect(network).await;

        assert!(matches!(result, Err(RuntimeError::UnknownDescriptor(_))));
        assert_eq!(f.descriptors.load_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_network_fails_fast() {
        let f = fixture();
        let network = NetworkConfig::new("broken", "not a url", "dot");

        let result = f.manager.connect(network).await;

        assert!(matches!(result, Err(RuntimeError::Config(_))));
        assert_eq!(f.transports.open_count(), 0);
        assert!(f.manager.status().error().is_some());
    }

    #[tokio::test]
    async fn test_disconnect_resets_state() {
        let f = fixture();
        f.manager.connect(polkadot()).await.unwrap();

        f.manager.disconnect();

        assert_eq!(f.manager.status(), ConnectionState::Disconnected);
        assert!(f.transports.opened()[0].is_closed());
        assert_eq!(f.manager.current_network(), Some(polkadot()));
    }

    #[tokio::test]
    async fn test_typed_api_without_network() {
        let f = fixture();
        assert!(matches!(
            f.manager.typed_api().await,
            Err(RuntimeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_typed_api_reconnects_after_disconnect() {
        let f = fixture();
        f.manager.connect(polkadot()).await.unwrap();
        f.manager.disconnect();

        let api = f.manager.typed_api().await.unwrap();

        assert_eq!(api.network(), "polkadot");
        assert_eq!(f.transports.open_count(), 2);
    }

    #[tokio::test]
    async fn test_typed_api_rebuilds_dead_transport() {
        let f = fixture();
        f.manager.connect(polkadot()).await.unwrap();

        // Peer hung up.
        f.transports.opened()[0].close();

        let api = f.manager.typed_api().await.unwrap();

        assert!(!api.is_closed());
        assert_eq!(api.network(), "polkadot");
        assert_eq!(f.transports.open_count(), 2);
        assert!(f.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_api_follows_newer_build() {
        let f = fixture();
        f.transports
            .set_delay("wss://polkadot.example", Duration::from_millis(500));
        let _first = f.manager.connect(polkadot());

        let manager = f.manager.clone();
        let waiter = tokio::spawn(async move { manager.typed_api().await });
        tokio::task::yield_now().await;

        let _second = f.manager.connect(kusama());
        let api = waiter.await.unwrap().unwrap();
        assert_eq!(api.network(), "kusama");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_build() {
        let f = fixture();
        f.transports
            .set_delay("wss://polkadot.example", Duration::from_millis(500));

        let handle = f.manager.connect(polkadot());
        assert!(handle.cancel());
        assert!(!handle.cancel());

        assert!(matches!(
            handle.wait().await,
            Err(RuntimeError::Superseded(_))
        ));
        assert_eq!(f.manager.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_after_error_restarts_cycle() {
        let f = fixture();
        let broken = NetworkConfig::new("broken", "not a url", "dot");
        assert!(f.manager.connect(broken).await.is_err());

        assert!(f.manager.connect(polkadot()).await.is_ok());
        assert!(f.manager.is_connected());
    }
}
