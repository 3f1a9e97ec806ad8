//! # Event Registry
//!
//! Logical subscriptions plus a bounded, newest-first log of chain events.
//!
//! The log is copy-on-write: each append swaps in a new `Arc<Vec<_>>`, so
//! readers holding an earlier snapshot are never affected by later appends.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::{
    ChainEvent, EventFilter, RawEvent, RuntimeResult, Subscription, DEFAULT_MAX_EVENTS,
};
use crate::ports::{SystemTimeSource, TimeSource};

/// Capacity of the live event feed.
const FEED_CAPACITY: usize = 1024;

/// Subscription bookkeeping and the bounded event log.
pub struct EventRegistry {
    subscriptions: DashMap<String, Subscription>,
    log: RwLock<Arc<Vec<ChainEvent>>>,
    max_events: AtomicUsize,
    clock: Arc<dyn TimeSource>,
    feed: broadcast::Sender<ChainEvent>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

impl EventRegistry {
    /// Registry keeping at most `max_events` events.
    pub fn new(max_events: usize) -> Self {
        Self::with_time_source(max_events, Arc::new(SystemTimeSource))
    }

    /// Registry stamped by `clock`.
    pub fn with_time_source(max_events: usize, clock: Arc<dyn TimeSource>) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            subscriptions: DashMap::new(),
            log: RwLock::new(Arc::new(Vec::new())),
            max_events: AtomicUsize::new(max_events),
            clock,
            feed,
        }
    }

    /// Register interest in `(section, method)` under `id`. An existing
    /// record with the same id is replaced.
    pub fn subscribe(&self, id: &str, section: &str, method: &str) -> Subscription {
        let subscription = Subscription {
            id: id.to_string(),
            section: section.to_string(),
            method: method.to_string(),
            active: true,
            last_event: None,
            error: None,
            created_at: self.clock.now(),
        };

        if self
            .subscriptions
            .insert(id.to_string(), subscription.clone())
            .is_some()
        {
            debug!(id, "subscription replaced");
        } else {
            debug!(id, section, method, "subscription added");
        }
        subscription
    }

    /// Remove the subscription `id`.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.subscriptions.remove(id).is_some();
        if removed {
            debug!(id, "subscription removed");
        }
        removed
    }

    /// Record a stream failure on `id` and mark it inactive.
    pub fn set_subscription_error(&self, id: &str, error: impl ToString) -> bool {
        match self.subscriptions.get_mut(id) {
            Some(mut subscription) => {
                let reason = error.to_string();
                warn!(id, error = %reason, "subscription failed");
                subscription.error = Some(reason);
                subscription.active = false;
                true
            }
            None => false,
        }
    }

    /// Mark `id` inactive without an error, e.g. when its stream ended.
    pub fn deactivate(&self, id: &str) -> bool {
        match self.subscriptions.get_mut(id) {
            Some(mut subscription) => {
                subscription.active = false;
                true
            }
            None => false,
        }
    }

    /// Subscription `id`, if registered.
    pub fn subscription(&self, id: &str) -> Option<Subscription> {
        self.subscriptions.get(id).map(|s| s.value().clone())
    }

    /// Every subscription, oldest first.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut all: Vec<Subscription> = self
            .subscriptions
            .iter()
            .map(|s| s.value().clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Drop every subscription.
    pub fn clear_subscriptions(&self) {
        let count = self.subscriptions.len();
        self.subscriptions.clear();
        if count > 0 {
            debug!(count, "subscriptions cleared");
        }
    }

    /// Prepend `event`, trimming the log to `max_events`, and record it as
    /// the last event of every matching subscription.
    pub fn add_event(&self, event: ChainEvent) {
        let max = self.max_events();
        {
            let mut log = self.log.write();
            let mut next = Vec::with_capacity(max.min(log.len() + 1));
            if max > 0 {
                next.push(event.clone());
                next.extend(log.iter().take(max - 1).cloned());
            }
            *log = Arc::new(next);
        }

        for mut subscription in self.subscriptions.iter_mut() {
            if subscription.matches(&event) {
                subscription.last_event = Some(event.clone());
            }
        }

        // No receivers is fine.
        let _ = self.feed.send(event);
    }

    /// Type `raw` and add it. Malformed payloads of known kinds are rejected.
    pub fn add_raw_event(&self, raw: RawEvent) -> RuntimeResult<ChainEvent> {
        let event = ChainEvent::from_raw(raw, self.clock.now())?;
        self.add_event(event.clone());
        Ok(event)
    }

    /// Events newest first, optionally filtered, never more than
    /// `max_events`.
    pub fn get_events(&self, filter: Option<&EventFilter>) -> Vec<ChainEvent> {
        let log = self.snapshot();
        log.iter()
            .take(self.max_events())
            .filter(|event| filter.is_none_or(|f| f.matches(event)))
            .cloned()
            .collect()
    }

    /// The log as stored, without copying.
    pub fn snapshot(&self) -> Arc<Vec<ChainEvent>> {
        Arc::clone(&self.log.read())
    }

    /// Number of visible events.
    pub fn len(&self) -> usize {
        self.log.read().len().min(self.max_events())
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the log. Subscriptions are kept.
    pub fn clear_events(&self) {
        *self.log.write() = Arc::new(Vec::new());
        debug!("event log cleared");
    }

    /// Change the log bound. Takes effect on reads immediately; storage is
    /// trimmed on the next append.
    pub fn set_max_events(&self, max_events: usize) {
        self.max_events.store(max_events, Ordering::Relaxed);
        debug!(max_events, "event log bound updated");
    }

    /// Current log bound.
    pub fn max_events(&self) -> usize {
        self.max_events.load(Ordering::Relaxed)
    }

    /// Live feed of every added event.
    pub fn feed(&self) -> broadcast::Receiver<ChainEvent> {
        self.feed.subscribe()
    }
}
