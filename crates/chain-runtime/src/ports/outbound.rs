//! # Outbound Ports
//!
//! Traits for external dependencies: the node transport, descriptor
//! metadata, snapshot storage and wall-clock time.
//!
//! Mock implementations live at the bottom of this file so both unit and
//! integration tests can drive the runtime without a live node.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use url::Url;

use crate::domain::{CacheSnapshot, ChainDescriptor, RuntimeError, RuntimeResult, Timestamp};

/// Stream of subscription notifications delivered by a transport.
pub type NotificationStream = BoxStream<'static, RuntimeResult<serde_json::Value>>;

/// Live transport to one node endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Endpoint this transport talks to.
    fn endpoint(&self) -> &str;

    /// Issue one request and await its result.
    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> RuntimeResult<serde_json::Value>;

    /// Open a notification stream. Dropping the stream unsubscribes.
    async fn subscribe(
        &self,
        method: &str,
        params: serde_json::Value,
        unsubscribe_method: &str,
    ) -> RuntimeResult<NotificationStream>;

    /// Release the transport. Idempotent.
    fn close(&self);

    /// Whether [`Transport::close`] was called or the peer went away.
    fn is_closed(&self) -> bool;
}

/// Opens transports.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport to `endpoint`.
    async fn open(&self, endpoint: &Url) -> RuntimeResult<Arc<dyn Transport>>;
}

/// Loads chain descriptors by key.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    /// Load the descriptor registered under `key`.
    async fn load(&self, key: &str) -> RuntimeResult<ChainDescriptor>;
}

/// Host storage for the opaque cache snapshot.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Read the stored snapshot, `None` when nothing was saved yet.
    async fn load(&self) -> RuntimeResult<Option<CacheSnapshot>>;

    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &CacheSnapshot) -> RuntimeResult<()>;
}

/// Time source for consistent timestamp handling.
///
/// Abstracted to allow testing with deterministic time.
pub trait TimeSource: Send + Sync {
    /// Returns the current timestamp in milliseconds.
    fn now(&self) -> Timestamp;
}

/// Default system time source.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

// =============================================================================
// Mock Implementations for Testing
// =============================================================================

/// Mock time source for testing.
#[derive(Debug, Default)]
pub struct MockTimeSource {
    time: AtomicU64,
}

impl MockTimeSource {
    /// Start the clock at `initial`.
    pub fn new(initial: Timestamp) -> Self {
        Self {
            time: AtomicU64::new(initial),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, ms: u64) {
        self.time.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set the clock.
    pub fn set(&self, time: Timestamp) {
        self.time.store(time, Ordering::SeqCst);
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> Timestamp {
        self.time.load(Ordering::SeqCst)
    }
}

/// Simulated node shared by every transport opened to its endpoint.
pub struct MockNode {
    responses: DashMap<String, serde_json::Value>,
    failures: DashMap<String, String>,
    notifications: broadcast::Sender<RuntimeResult<serde_json::Value>>,
    requests: AtomicUsize,
    subscribes: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl Default for MockNode {
    fn default() -> Self {
        let (notifications, _) = broadcast::channel(256);
        Self {
            responses: DashMap::new(),
            failures: DashMap::new(),
            notifications,
            requests: AtomicUsize::new(0),
            subscribes: AtomicUsize::new(0),
            latency: Mutex::new(None),
        }
    }
}

impl MockNode {
    fn lookup_key(method: &str, params: &serde_json::Value) -> String {
        format!("{method}:{params}")
    }

    /// Answer every `method` request with `result`.
    pub fn set_response(&self, method: &str, result: serde_json::Value) {
        self.responses.insert(method.to_string(), result);
    }

    /// Answer `method` requests carrying exactly `params` with `result`.
    pub fn set_response_for(
        &self,
        method: &str,
        params: &serde_json::Value,
        result: serde_json::Value,
    ) {
        self.responses
            .insert(Self::lookup_key(method, params), result);
    }

    /// Make every `method` request fail.
    pub fn set_failure(&self, method: &str, reason: &str) {
        self.failures.insert(method.to_string(), reason.to_string());
    }

    /// Stop failing `method` requests.
    pub fn clear_failure(&self, method: &str) {
        self.failures.remove(method);
    }

    /// Delay every request by `latency` before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Push a notification to every open subscription. Returns receivers reached.
    pub fn emit(&self, notification: serde_json::Value) -> usize {
        self.notifications.send(Ok(notification)).unwrap_or(0)
    }

    /// Push a stream failure to every open subscription.
    pub fn emit_error(&self, error: RuntimeError) -> usize {
        self.notifications.send(Err(error)).unwrap_or(0)
    }

    /// Requests served so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Subscriptions opened so far.
    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Currently open subscriptions.
    pub fn live_subscriptions(&self) -> usize {
        self.notifications.receiver_count()
    }

    fn answer(&self, method: &str, params: &serde_json::Value) -> RuntimeResult<serde_json::Value> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if let Some(reason) = self.failures.get(method) {
            return Err(RuntimeError::query(reason.value()));
        }

        self.responses
            .get(&Self::lookup_key(method, params))
            .or_else(|| self.responses.get(method))
            .map(|r| r.value().clone())
            .ok_or_else(|| RuntimeError::query(format!("no mock response for {method}")))
    }
}

/// Mock transport handle onto a [`MockNode`].
pub struct MockTransport {
    endpoint: String,
    node: Arc<MockNode>,
    closed: AtomicBool,
}

impl MockTransport {
    /// Open a handle onto `node`.
    pub fn new(endpoint: impl Into<String>, node: Arc<MockNode>) -> Self {
        Self {
            endpoint: endpoint.into(),
            node,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> RuntimeResult<()> {
        if self.is_closed() {
            return Err(RuntimeError::transport(&self.endpoint, "transport closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> RuntimeResult<serde_json::Value> {
        self.ensure_open()?;
        let latency = *self.node.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
            self.ensure_open()?;
        }
        self.node.answer(method, &params)
    }

    async fn subscribe(
        &self,
        method: &str,
        _params: serde_json::Value,
        _unsubscribe_method: &str,
    ) -> RuntimeResult<NotificationStream> {
        self.ensure_open()?;
        if let Some(reason) = self.node.failures.get(method) {
            return Err(RuntimeError::query(reason.value()));
        }
        self.node.subscribes.fetch_add(1, Ordering::SeqCst);

        let stream = BroadcastStream::new(self.node.notifications.subscribe())
            .filter_map(|item| async move { item.ok() });
        Ok(stream.boxed())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Mock transport factory with failure and latency injection.
#[derive(Default)]
pub struct MockTransportFactory {
    nodes: DashMap<String, Arc<MockNode>>,
    delays: DashMap<String, Duration>,
    failures_remaining: AtomicU32,
    opens: AtomicUsize,
    opened: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    /// Empty factory: every endpoint opens successfully.
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(endpoint: &str) -> String {
        Url::parse(endpoint)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| endpoint.to_string())
    }

    /// Simulated node behind `endpoint`, created on first use.
    pub fn node(&self, endpoint: &str) -> Arc<MockNode> {
        self.nodes
            .entry(Self::normalize(endpoint))
            .or_default()
            .clone()
    }

    /// Fail the next `count` opens with a transport error.
    pub fn fail_next_opens(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Delay every open to `endpoint`.
    pub fn set_delay(&self, endpoint: &str, delay: Duration) {
        self.delays.insert(Self::normalize(endpoint), delay);
    }

    /// Open attempts so far, failed ones included.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Transports handed out so far.
    pub fn opened(&self) -> Vec<Arc<MockTransport>> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn open(&self, endpoint: &Url) -> RuntimeResult<Arc<dyn Transport>> {
        let key = endpoint.to_string();
        self.opens.fetch_add(1, Ordering::SeqCst);

        let delay = self.delays.get(&key).map(|d| *d.value());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RuntimeError::transport(&key, "mock connection refused"));
        }

        let transport = Arc::new(MockTransport::new(key.clone(), self.node(&key)));
        self.opened.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Mock descriptor source with failure and latency injection.
#[derive(Default)]
pub struct MockDescriptorSource {
    descriptors: DashMap<String, ChainDescriptor>,
    failures_remaining: AtomicU32,
    loads: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MockDescriptorSource {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor under its own key.
    pub fn with_descriptor(self, descriptor: ChainDescriptor) -> Self {
        self.descriptors.insert(descriptor.key.clone(), descriptor);
        self
    }

    /// Fail the next `count` loads with a retryable error.
    pub fn fail_next_loads(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Delay every load.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Loads attempted so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DescriptorSource for MockDescriptorSource {
    async fn load(&self, key: &str) -> RuntimeResult<ChainDescriptor> {
        self.loads.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RuntimeError::descriptor_load(key, "mock metadata fetch failed"));
        }

        self.descriptors
            .get(key)
            .map(|d| d.value().clone())
            .ok_or_else(|| RuntimeError::UnknownDescriptor(key.to_string()))
    }
}

/// Snapshot store kept in memory.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshot: Mutex<Option<CacheSnapshot>>,
    saves: AtomicUsize,
}

impl InMemorySnapshotStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Times [`SnapshotStore::save`] was called.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Last saved snapshot.
    pub fn current(&self) -> Option<CacheSnapshot> {
        self.snapshot.lock().clone()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self) -> RuntimeResult<Option<CacheSnapshot>> {
        Ok(self.snapshot.lock().clone())
    }

    async fn save(&self, snapshot: &CacheSnapshot) -> RuntimeResult<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
