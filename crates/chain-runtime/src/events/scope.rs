//! # Subscription Scopes
//!
//! Ties the lifetime of a logical event subscription to a guard value.
//!
//! Acquiring a scope registers the subscription and starts a pump task that
//! feeds the node's event stream into the [`EventRegistry`]. Scopes for the
//! same `(section, method)` share one pump. When the last scope for a kind
//! is dropped the pump stops, the node stream is released and the
//! subscription is removed.

use dashmap::DashMap;
use futures::StreamExt;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::registry::EventRegistry;
use crate::connection::{RawEventStream, TypedApi};
use crate::domain::{RuntimeError, RuntimeResult, Subscription};

#[derive(Default)]
struct ScopesInner {
    pumps: DashMap<String, Weak<Pump>>,
}

struct Pump {
    id: String,
    registry: Arc<EventRegistry>,
    scopes: Weak<ScopesInner>,
    task: JoinHandle<()>,
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.task.abort();

        let Some(scopes) = self.scopes.upgrade() else {
            return;
        };
        // A newer pump may already own the id after a reconnect.
        let owned = scopes
            .pumps
            .remove_if(&self.id, |_, pump| pump.strong_count() == 0)
            .is_some();
        if owned {
            self.registry.unsubscribe(&self.id);
            debug!(id = %self.id, "event subscription released");
        }
    }
}

/// Live pumps keyed by subscription id.
#[derive(Clone, Default)]
pub struct SubscriptionScopes {
    inner: Arc<ScopesInner>,
}

impl SubscriptionScopes {
    /// No live pumps.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `(section, method)` events through `api`, recording
    /// them in `registry` for as long as the returned scope lives.
    pub async fn acquire(
        &self,
        registry: &Arc<EventRegistry>,
        api: &TypedApi,
        section: &str,
        method: &str,
    ) -> RuntimeResult<EventSubscriptionScope> {
        let id = Subscription::key_for(section, method);

        if let Some(pump) = self.live(&id) {
            debug!(id = %id, "joining existing event subscription");
            return Ok(EventSubscriptionScope { pump });
        }

        if !api.has_event(section, method) {
            return Err(RuntimeError::Subscription {
                id,
                reason: format!("{} has no event {section}.{method}", api.network()),
            });
        }

        let stream = api
            .subscribe_events()
            .await
            .map_err(|e| RuntimeError::Subscription {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        let mut slot = self.inner.pumps.entry(id.clone()).or_default();
        if let Some(pump) = slot.upgrade() {
            // Lost a race with a concurrent acquire; our stream is dropped.
            return Ok(EventSubscriptionScope { pump });
        }

        registry.subscribe(&id, section, method);
        let task = tokio::spawn(pump_events(
            stream,
            Arc::clone(registry),
            id.clone(),
            section.to_string(),
            method.to_string(),
        ));
        let pump = Arc::new(Pump {
            id: id.clone(),
            registry: Arc::clone(registry),
            scopes: Arc::downgrade(&self.inner),
            task,
        });
        *slot = Arc::downgrade(&pump);
        debug!(id = %id, network = api.network(), "event subscription started");

        Ok(EventSubscriptionScope { pump })
    }

    /// Stop every pump. Outstanding scopes become inert and no longer
    /// unsubscribe on drop.
    pub fn abort_all(&self) {
        let ids: Vec<String> = self.inner.pumps.iter().map(|p| p.key().clone()).collect();
        for id in ids {
            let Some((_, pump)) = self.inner.pumps.remove(&id) else {
                continue;
            };
            if let Some(pump) = pump.upgrade() {
                pump.task.abort();
            }
        }
    }

    /// Number of live pumps.
    pub fn len(&self) -> usize {
        self.inner
            .pumps
            .iter()
            .filter(|p| p.value().strong_count() > 0)
            .count()
    }

    /// Whether no pump is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live(&self, id: &str) -> Option<Arc<Pump>> {
        self.inner.pumps.get(id).and_then(|p| p.value().upgrade())
    }
}

/// Guard for one logical event subscription. Dropping it releases the
/// subscription once no other scope for the same kind remains.
#[derive(Clone)]
pub struct EventSubscriptionScope {
    pump: Arc<Pump>,
}

impl fmt::Debug for EventSubscriptionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscriptionScope")
            .field("id", &self.pump.id)
            .finish()
    }
}

impl EventSubscriptionScope {
    /// Subscription id (`section:method`).
    pub fn id(&self) -> &str {
        &self.pump.id
    }

    /// Current bookkeeping record, if still registered.
    pub fn subscription(&self) -> Option<Subscription> {
        self.pump.registry.subscription(&self.pump.id)
    }

    /// Whether the subscription is registered and its stream healthy.
    pub fn is_active(&self) -> bool {
        self.subscription().is_some_and(|s| s.active)
    }

    /// Release this scope now.
    pub fn release(self) {}
}

async fn pump_events(
    mut stream: RawEventStream,
    registry: Arc<EventRegistry>,
    id: String,
    section: String,
    method: String,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(raw) if raw.section == section && raw.method == method => {
                if let Err(e) = registry.add_raw_event(raw) {
                    warn!(id = %id, error = %e, "dropping malformed event");
                }
            }
            Ok(_) => {}
            Err(e @ RuntimeError::InvalidEvent { .. }) => {
                warn!(id = %id, error = %e, "dropping undecodable notification");
            }
            Err(e) => {
                registry.set_subscription_error(&id, e);
                return;
            }
        }
    }

    debug!(id = %id, "event stream ended");
    registry.deactivate(&id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChainDescriptor, NetworkConfig, PalletDescriptor};
    use crate::ports::{MockNode, MockTransport};
    use serde_json::json;
    use std::time::Duration;

    fn api() -> (TypedApi, Arc<MockNode>) {
        let node = Arc::new(MockNode::default());
        let transport = Arc::new(MockTransport::new("ws://local/", node.clone()));
        let descriptor = ChainDescriptor::new("dev").with_pallet(
            PalletDescriptor::new("Balances").events(["Transfer", "Deposit"]),
        );
        let network = NetworkConfig::new("local", "ws://local", "dev");
        let api = TypedApi::derive(&network, transport, Arc::new(descriptor)).unwrap();
        (api, node)
    }

    fn transfer(block: u64) -> serde_json::Value {
        json!({
            "section": "Balances",
            "method": "Transfer",
            "data": { "from": "alice", "to": "bob", "amount": 5 },
            "blockNumber": block,
            "index": 0
        })
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_pump_records_matching_events() {
        let (api, node) = api();
        let registry = Arc::new(EventRegistry::default());
        let scopes = SubscriptionScopes::new();

        let scope = scopes
            .acquire(&registry, &api, "Balances", "Transfer")
            .await
            .unwrap();
        assert_eq!(scope.id(), "Balances:Transfer");

        node.emit(transfer(1));
        node.emit(json!({ "section": "Balances", "method": "Deposit", "data": { "who": "bob", "amount": 1 } }));
        settle().await;

        let events = registry.get_events(None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "1-0");
        assert_eq!(scope.subscription().unwrap().last_event.unwrap().id, "1-0");
    }

    #[tokio::test]
    async fn test_scopes_share_one_stream() {
        let (api, node) = api();
        let registry = Arc::new(EventRegistry::default());
        let scopes = SubscriptionScopes::new();

        let first = scopes.acquire(&registry, &api, "Balances", "Transfer").await.unwrap();
        let second = scopes.acquire(&registry, &api, "Balances", "Transfer").await.unwrap();

        assert_eq!(node.subscribe_count(), 1);
        assert_eq!(registry.subscriptions().len(), 1);

        drop(first);
        assert!(second.is_active());

        second.release();
        settle().await;
        assert!(registry.subscriptions().is_empty());
        assert!(scopes.is_empty());
        assert_eq!(node.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_stream_failure_sets_error() {
        let (api, node) = api();
        let registry = Arc::new(EventRegistry::default());
        let scopes = SubscriptionScopes::new();

        let scope = scopes.acquire(&registry, &api, "Balances", "Transfer").await.unwrap();
        node.emit_error(RuntimeError::transport("ws://local/", "socket reset"));
        settle().await;

        let subscription = scope.subscription().unwrap();
        assert!(!subscription.active);
        assert!(subscription.error.unwrap().contains("socket reset"));
    }

    #[tokio::test]
    async fn test_unknown_event_kind_rejected() {
        let (api, node) = api();
        let registry = Arc::new(EventRegistry::default());
        let scopes = SubscriptionScopes::new();

        let result = scopes.acquire(&registry, &api, "Staking", "Rewarded").await;

        assert!(matches!(result, Err(RuntimeError::Subscription { .. })));
        assert_eq!(node.subscribe_count(), 0);
        assert!(registry.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_abort_all_makes_scopes_inert() {
        let (api, node) = api();
        let registry = Arc::new(EventRegistry::default());
        let scopes = SubscriptionScopes::new();

        let stale = scopes.acquire(&registry, &api, "Balances", "Transfer").await.unwrap();
        scopes.abort_all();
        registry.clear_subscriptions();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(node.live_subscriptions(), 0);

        let fresh = scopes.acquire(&registry, &api, "Balances", "Transfer").await.unwrap();
        drop(stale);

        assert!(fresh.is_active());
        assert_eq!(registry.subscriptions().len(), 1);
    }
}
