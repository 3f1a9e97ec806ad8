//! # Typed API
//!
//! Descriptor-checked surface over a live transport. Every storage read,
//! constant lookup, submission and event subscription is validated against
//! the chain descriptor before it reaches the node.

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;

use crate::domain::{ChainDescriptor, NetworkConfig, RawEvent, RuntimeError, RuntimeResult};
use crate::ports::Transport;

/// Storage read method.
pub const STORAGE_METHOD: &str = "runtime_queryStorage";

/// Extrinsic submission method.
pub const SUBMIT_METHOD: &str = "runtime_submit";

/// Event subscription method.
pub const EVENTS_SUBSCRIBE_METHOD: &str = "runtime_subscribeEvents";

/// Event unsubscription method.
pub const EVENTS_UNSUBSCRIBE_METHOD: &str = "runtime_unsubscribeEvents";

/// Placeholder section/method for notifications that are not events at all.
const UNKNOWN_KIND: &str = "<unknown>";

/// Stream of untyped events from the node.
pub type RawEventStream = BoxStream<'static, RuntimeResult<RawEvent>>;

/// Node notifications carry either one event or one block's worth.
#[derive(Deserialize)]
#[serde(untagged)]
enum EventBatch {
    One(RawEvent),
    Many(Vec<RawEvent>),
}

struct ApiInner {
    network: String,
    transport: Arc<dyn Transport>,
    descriptor: Arc<ChainDescriptor>,
}

/// Typed API handle. Cheap to clone.
#[derive(Clone)]
pub struct TypedApi {
    inner: Arc<ApiInner>,
}

impl fmt::Debug for TypedApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedApi")
            .field("network", &self.inner.network)
            .field("endpoint", &self.inner.transport.endpoint())
            .field("descriptor", &self.inner.descriptor.key)
            .finish()
    }
}

impl TypedApi {
    /// Derive the API for `network` from an open transport and its descriptor.
    pub fn derive(
        network: &NetworkConfig,
        transport: Arc<dyn Transport>,
        descriptor: Arc<ChainDescriptor>,
    ) -> RuntimeResult<Self> {
        if descriptor.key != network.descriptor_key {
            return Err(RuntimeError::Config(format!(
                "network '{}' expects descriptor '{}', got '{}'",
                network.name, network.descriptor_key, descriptor.key
            )));
        }

        Ok(Self {
            inner: Arc::new(ApiInner {
                network: network.name.clone(),
                transport,
                descriptor,
            }),
        })
    }

    /// Network this API belongs to.
    pub fn network(&self) -> &str {
        &self.inner.network
    }

    /// Endpoint of the underlying transport.
    pub fn endpoint(&self) -> &str {
        self.inner.transport.endpoint()
    }

    /// Descriptor the API was derived from.
    pub fn descriptor(&self) -> &ChainDescriptor {
        &self.inner.descriptor
    }

    pub(crate) fn close(&self) {
        self.inner.transport.close();
    }

    /// Whether the underlying transport is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.transport.is_closed()
    }

    /// Read `section.item` with `args`.
    pub async fn query_storage(
        &self,
        section: &str,
        item: &str,
        args: serde_json::Value,
    ) -> RuntimeResult<serde_json::Value> {
        if !self.inner.descriptor.has_storage(section, item) {
            return Err(RuntimeError::query(format!(
                "{}: unknown storage item {section}.{item}",
                self.inner.network
            )));
        }

        self.inner
            .transport
            .request(
                STORAGE_METHOD,
                json!({ "section": section, "item": item, "args": args }),
            )
            .await
    }

    /// Constant `section.name` from the descriptor. No network round trip.
    pub fn constant(&self, section: &str, name: &str) -> RuntimeResult<serde_json::Value> {
        self.inner
            .descriptor
            .constant(section, name)
            .cloned()
            .ok_or_else(|| {
                RuntimeError::query(format!(
                    "{}: unknown constant {section}.{name}",
                    self.inner.network
                ))
            })
    }

    /// Submit call `section.call` with `args`; returns the node's receipt.
    pub async fn submit(
        &self,
        section: &str,
        call: &str,
        args: serde_json::Value,
    ) -> RuntimeResult<serde_json::Value> {
        if !self.inner.descriptor.has_call(section, call) {
            return Err(RuntimeError::query(format!(
                "{}: unknown call {section}.{call}",
                self.inner.network
            )));
        }

        self.inner
            .transport
            .request(
                SUBMIT_METHOD,
                json!({ "section": section, "call": call, "args": args }),
            )
            .await
    }

    /// Pass-through request for methods the descriptor does not model.
    pub async fn rpc(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> RuntimeResult<serde_json::Value> {
        self.inner.transport.request(method, params).await
    }

    /// Open the node's event stream. Undecodable notifications surface as
    /// [`RuntimeError::InvalidEvent`] items without ending the stream.
    pub async fn subscribe_events(&self) -> RuntimeResult<RawEventStream> {
        let notifications = self
            .inner
            .transport
            .subscribe(EVENTS_SUBSCRIBE_METHOD, json!([]), EVENTS_UNSUBSCRIBE_METHOD)
            .await?;

        let events = notifications.flat_map(|item| {
            let batch: Vec<RuntimeResult<RawEvent>> = match item {
                Ok(value) => match serde_json::from_value::<EventBatch>(value) {
                    Ok(EventBatch::One(event)) => vec![Ok(event)],
                    Ok(EventBatch::Many(events)) => events.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(RuntimeError::InvalidEvent {
                        section: UNKNOWN_KIND.to_string(),
                        method: UNKNOWN_KIND.to_string(),
                        reason: e.to_string(),
                    })],
                },
                Err(e) => vec![Err(e)],
            };
            stream::iter(batch)
        });

        Ok(events.boxed())
    }

    /// Whether `section.method` is an event of this chain.
    pub fn has_event(&self, section: &str, method: &str) -> bool {
        self.inner.descriptor.has_event(section, method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PalletDescriptor;
    use crate::ports::{MockNode, MockTransport};

    fn descriptor() -> Arc<ChainDescriptor> {
        Arc::new(
            ChainDescriptor::new("dev").with_pallet(
                PalletDescriptor::new("System")
                    .storage(["Number"])
                    .calls(["remark"])
                    .events(["ExtrinsicSuccess"])
                    .constant("BlockHashCount", json!(2400)),
            ),
        )
    }

    fn api() -> (TypedApi, Arc<MockNode>) {
        let node = Arc::new(MockNode::default());
        let transport = Arc::new(MockTransport::new("ws://local/", node.clone()));
        let network = NetworkConfig::new("local", "ws://local", "dev");
        (TypedApi::derive(&network, transport, descriptor()).unwrap(), node)
    }

    #[test]
    fn test_derive_rejects_mismatched_descriptor() {
        let node = Arc::new(MockNode::default());
        let transport = Arc::new(MockTransport::new("ws://local/", node));
        let network = NetworkConfig::new("local", "ws://local", "other");
        assert!(TypedApi::derive(&network, transport, descriptor()).is_err());
    }

    #[tokio::test]
    async fn test_query_storage_checks_descriptor() {
        let (api, node) = api();
        node.set_response(STORAGE_METHOD, json!(7));

        assert_eq!(
            api.query_storage("System", "Number", json!([])).await.unwrap(),
            json!(7)
        );
        assert!(api.query_storage("System", "Missing", json!([])).await.is_err());
        assert_eq!(node.request_count(), 1);
    }

    #[tokio::test]
    async fn test_submit_and_constant() {
        let (api, node) = api();
        node.set_response(SUBMIT_METHOD, json!({ "hash": "0x01" }));

        assert!(api.submit("System", "remark", json!(["hi"])).await.is_ok());
        assert!(api.submit("Balances", "transfer", json!([])).await.is_err());
        assert_eq!(api.constant("System", "BlockHashCount").unwrap(), json!(2400));
        assert!(api.constant("System", "Nope").is_err());
    }

    #[tokio::test]
    async fn test_event_stream_flattens_batches() {
        let (api, node) = api();
        let mut events = api.subscribe_events().await.unwrap();

        node.emit(json!([
            { "section": "System", "method": "ExtrinsicSuccess", "index": 0 },
            { "section": "System", "method": "ExtrinsicSuccess", "index": 1 }
        ]));
        node.emit(json!("garbage"));

        assert_eq!(events.next().await.unwrap().unwrap().index, 0);
        assert_eq!(events.next().await.unwrap().unwrap().index, 1);
        assert!(matches!(
            events.next().await.unwrap(),
            Err(RuntimeError::InvalidEvent { .. })
        ));
    }
}
