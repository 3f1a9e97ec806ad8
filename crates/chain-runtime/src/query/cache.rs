//! # Query Cache
//!
//! Keyed read cache with in-flight deduplication, TTL freshness,
//! stale-while-error retention, per-read timeouts and batch eviction.
//!
//! ## Read Path
//!
//! ```text
//! execute_query(key, read, opts)
//!     │
//!     ├─ !force && key in flight ──► await that read's result (coalesced)
//!     ├─ !force && fresh success ──► return cached data (hit)
//!     └─ otherwise ──► register in flight, mark loading (unless background)
//!                         │
//!                         ▼
//!                    read() raced against timeout
//!                         │
//!               ┌─────────┴─────────┐
//!               ▼                   ▼
//!           success               failure
//!        {data, success}    {old data, error}
//!               └─────────┬─────────┘
//!                         ▼
//!              remove own in-flight record
//! ```
//!
//! The in-flight check and insert happen under one lock, so two callers can
//! never both start a read for the same key unless one of them forces it.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::{
    CacheConfig, CacheConfigUpdate, CacheEntry, CacheSnapshot, PersistedEntry, QueryOptions,
    QueryResult, QueryStatus, RuntimeError, RuntimeResult, Timestamp, SNAPSHOT_VERSION,
};
use crate::ports::{SnapshotStore, SystemTimeSource, TimeSource};

type SharedRead = Shared<BoxFuture<'static, Option<serde_json::Value>>>;

/// Capacity of the key-change broadcast.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

struct InFlight {
    op: u64,
    read: SharedRead,
}

/// Identifies one read: its operation number and the cache epoch it began in.
#[derive(Clone, Copy)]
struct ReadTicket {
    op: u64,
    epoch: u64,
}

enum Plan {
    Cached(serde_json::Value),
    Await(SharedRead),
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Reads answered from a fresh entry.
    pub hits: u64,
    /// Reads that ran the read function.
    pub misses: u64,
    /// Reads that joined a pending read.
    pub coalesced: u64,
    /// Entries purged by eviction.
    pub evictions: u64,
    /// Reads that timed out.
    pub timeouts: u64,
    /// Reads that failed for any other reason.
    pub failures: u64,
    /// Entries currently stored.
    pub entries: usize,
    /// Keys with a pending read.
    pub in_flight: usize,
}

struct CacheInner {
    entries: RwLock<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    config: RwLock<CacheConfig>,
    clock: Arc<dyn TimeSource>,
    updates: broadcast::Sender<String>,
    counters: CacheCounters,
    next_op: AtomicU64,
    /// Bumped by `invalidate_all`; reads started under an older epoch
    /// settle without touching entries.
    epoch: AtomicU64,
}

/// Read cache shared by every consumer of a runtime. Cheap to clone.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    /// Create a cache with `config`, stamped by the system clock.
    pub fn new(config: CacheConfig) -> RuntimeResult<Self> {
        Self::with_time_source(config, Arc::new(SystemTimeSource))
    }

    /// Create a cache stamped by `clock`.
    pub fn with_time_source(config: CacheConfig, clock: Arc<dyn TimeSource>) -> RuntimeResult<Self> {
        config.validate()?;
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(CacheInner {
                entries: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                config: RwLock::new(config),
                clock,
                updates,
                counters: CacheCounters::default(),
                next_op: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
            }),
        })
    }

    /// Run `read` for `key`, deduplicated and cached.
    ///
    /// Never fails: a failed or timed-out read resolves to `None` and the
    /// error, alongside any earlier data, stays visible through
    /// [`QueryCache::get_query_result`].
    pub async fn execute_query<F, Fut>(
        &self,
        key: impl Into<String>,
        read: F,
        options: QueryOptions,
    ) -> Option<serde_json::Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = RuntimeResult<serde_json::Value>> + Send + 'static,
    {
        let key = key.into();
        let config = self.inner.config.read().clone();

        let plan = {
            let mut in_flight = self.inner.in_flight.lock();
            let (pending, cached) = if options.force {
                (None, None)
            } else {
                (
                    in_flight.get(&key).map(|f| f.read.clone()),
                    self.inner.fresh_data(&key, config.ttl_ms),
                )
            };

            if let Some(read) = pending {
                self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "joining in-flight read");
                Plan::Await(read)
            } else if let Some(data) = cached {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                Plan::Cached(data)
            } else {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                let op = self.inner.next_op.fetch_add(1, Ordering::Relaxed);
                let timeout = options.timeout.unwrap_or_else(|| config.timeout());
                let epoch = self.inner.epoch.load(Ordering::Acquire);
                let shared = CacheInner::prepare_read(
                    Arc::downgrade(&self.inner),
                    key.clone(),
                    ReadTicket { op, epoch },
                    read,
                    timeout,
                );
                if options.force && in_flight.contains_key(&key) {
                    debug!(key = %key, "forced read replaces pending read");
                }
                in_flight.insert(
                    key.clone(),
                    InFlight {
                        op,
                        read: shared.clone(),
                    },
                );
                self.inner.begin(&key, options.background, &config);

                // Only once the entry is loading, so the read cannot settle first.
                // Spawned so it settles even if every caller stops awaiting.
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    runtime.spawn(shared.clone());
                }
                Plan::Await(shared)
            }
        };

        match plan {
            Plan::Cached(data) => Some(data),
            Plan::Await(read) => read.await,
        }
    }

    /// Typed wrapper over [`QueryCache::execute_query`].
    pub async fn execute_query_as<T, F, Fut>(
        &self,
        key: impl Into<String>,
        read: F,
        options: QueryOptions,
    ) -> Option<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = RuntimeResult<T>> + Send + 'static,
    {
        let key = key.into();
        let value = self
            .execute_query(
                key.clone(),
                move || async move {
                    let typed = read().await?;
                    Ok(serde_json::to_value(typed)?)
                },
                options,
            )
            .await?;

        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(key = %key, error = %e, "cached value does not decode as requested type");
                None
            }
        }
    }

    /// Current entry for `key`; an idle placeholder if never queried.
    pub fn get_query_result(&self, key: &str) -> QueryResult {
        self.inner
            .entries
            .read()
            .get(key)
            .cloned()
            .unwrap_or_else(|| CacheEntry::idle(key))
    }

    /// Current entry for `key` with its data decoded as `T`.
    pub fn get_query_result_as<T: DeserializeOwned>(&self, key: &str) -> RuntimeResult<QueryResult<T>> {
        self.get_query_result(key).decode()
    }

    /// Drop the entry for `key` so the next read hits the network.
    pub fn invalidate_query(&self, key: &str) -> bool {
        let removed = self.inner.entries.write().remove(key).is_some();
        if removed {
            debug!(key, "cache entry invalidated");
            self.inner.notify(key);
        }
        removed
    }

    /// Drop every entry and detach every pending read.
    ///
    /// Reads already running still resolve for the callers awaiting them,
    /// but their results are not stored and later callers start fresh reads.
    pub fn invalidate_all(&self) {
        let (keys, detached) = {
            let mut in_flight = self.inner.in_flight.lock();
            let mut entries = self.inner.entries.write();
            self.inner.epoch.fetch_add(1, Ordering::AcqRel);
            let keys: Vec<String> = entries.drain().map(|(k, _)| k).collect();
            let detached = in_flight.len();
            in_flight.clear();
            (keys, detached)
        };
        debug!(count = keys.len(), detached, "cache cleared");
        for key in &keys {
            self.inner.notify(key);
        }
    }

    /// Apply a partial policy update. Shrinking `max_size` purges the oldest
    /// entries at once.
    pub fn set_cache_config(&self, update: CacheConfigUpdate) -> RuntimeResult<CacheConfig> {
        let config = {
            let mut current = self.inner.config.write();
            let mut next = current.clone();
            next.apply(&update);
            next.validate()?;
            *current = next.clone();
            next
        };

        let evicted = {
            let mut entries = self.inner.entries.write();
            let excess = entries.len().saturating_sub(config.max_size);
            self.inner.evict_oldest(&mut entries, excess)
        };

        info!(
            ttl_ms = config.ttl_ms,
            max_size = config.max_size,
            timeout_ms = config.timeout_ms,
            evicted,
            "cache policy updated"
        );
        Ok(config)
    }

    /// Current policy.
    pub fn config(&self) -> CacheConfig {
        self.inner.config.read().clone()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// Whether no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// Whether `key` is stored.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.read().contains_key(key)
    }

    /// Stored keys, unordered.
    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.read().keys().cloned().collect()
    }

    /// Whether a read for `key` is pending.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.in_flight.lock().contains_key(key)
    }

    /// Receiver of keys whose entry changed.
    pub fn watch(&self) -> broadcast::Receiver<String> {
        self.inner.updates.subscribe()
    }

    /// Counters plus current sizes.
    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            entries: self.len(),
            in_flight: self.inner.in_flight.lock().len(),
        }
    }

    /// Successful entries plus policy, for persistence by the host.
    pub fn snapshot(&self) -> CacheSnapshot {
        let policy = self.inner.config.read().clone();
        let entries = self
            .inner
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.is_persistable())
            .filter_map(|(key, entry)| {
                Some((
                    key.clone(),
                    PersistedEntry {
                        data: entry.data.clone()?,
                        timestamp: entry.timestamp?,
                    },
                ))
            })
            .collect();

        CacheSnapshot {
            version: SNAPSHOT_VERSION,
            policy,
            entries,
        }
    }

    /// Load a snapshot. Entries keep their original timestamps, so the TTL
    /// keeps counting from when they were fetched. Keys with a read in flight
    /// or newer data are left alone. Returns the number of entries restored.
    pub fn rehydrate(&self, snapshot: CacheSnapshot) -> RuntimeResult<usize> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(RuntimeError::Persistence(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }
        snapshot
            .policy
            .validate()
            .map_err(|e| RuntimeError::Persistence(format!("snapshot policy rejected: {e}")))?;

        let max_size = snapshot.policy.max_size;
        *self.inner.config.write() = snapshot.policy;

        let mut newest_first: Vec<(String, PersistedEntry)> = snapshot.entries.into_iter().collect();
        newest_first.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp));

        let mut restored = Vec::new();
        {
            let mut entries = self.inner.entries.write();
            for (key, persisted) in newest_first {
                if let Some(existing) = entries.get(&key) {
                    let newer = existing.timestamp.is_some_and(|ts| ts >= persisted.timestamp);
                    if existing.status == QueryStatus::Loading || newer {
                        continue;
                    }
                } else if entries.len() >= max_size {
                    continue;
                }

                let mut entry = CacheEntry::idle(key.as_str());
                entry.settle_success(persisted.data, persisted.timestamp);
                entries.insert(key.clone(), entry);
                restored.push(key);
            }
        }

        for key in &restored {
            self.inner.notify(key);
        }
        info!(restored = restored.len(), "cache rehydrated from snapshot");
        Ok(restored.len())
    }

    /// Save a snapshot through `store`. Returns the number of entries saved.
    pub async fn persist(&self, store: &dyn SnapshotStore) -> RuntimeResult<usize> {
        let snapshot = self.snapshot();
        let count = snapshot.entries.len();
        store.save(&snapshot).await?;
        debug!(entries = count, "cache snapshot persisted");
        Ok(count)
    }

    /// Rehydrate from `store`, if it holds a snapshot.
    pub async fn restore(&self, store: &dyn SnapshotStore) -> RuntimeResult<usize> {
        match store.load().await? {
            Some(snapshot) => self.rehydrate(snapshot),
            None => Ok(0),
        }
    }
}

impl CacheInner {
    fn prepare_read<F, Fut>(
        cache: Weak<Self>,
        key: String,
        ticket: ReadTicket,
        read: F,
        timeout: Duration,
    ) -> SharedRead
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = RuntimeResult<serde_json::Value>> + Send + 'static,
    {
        let shared = async move {
            let outcome = match tokio::time::timeout(timeout, async move { read().await }).await {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::Timeout {
                    key: key.clone(),
                    after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            };

            match cache.upgrade() {
                Some(cache) => cache.settle(&key, ticket, outcome),
                None => outcome.ok(),
            }
        }
        .boxed()
        .shared();
        shared
    }

    fn fresh_data(&self, key: &str, ttl_ms: u64) -> Option<serde_json::Value> {
        let now = self.clock.now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.is_fresh(now, ttl_ms))
            .and_then(|entry| entry.data.clone())
    }

    fn begin(&self, key: &str, background: bool, config: &CacheConfig) {
        {
            let mut entries = self.entries.write();
            if !entries.contains_key(key) {
                self.make_room(&mut entries, config);
            }
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| CacheEntry::idle(key));
            if !background {
                entry.mark_loading();
            }
        }
        self.notify(key);
    }

    fn settle(
        &self,
        key: &str,
        ticket: ReadTicket,
        outcome: RuntimeResult<serde_json::Value>,
    ) -> Option<serde_json::Value> {
        let now = self.clock.now();
        let config = self.config.read().clone();

        let data = {
            let mut entries = self.entries.write();
            if self.epoch.load(Ordering::Acquire) != ticket.epoch {
                debug!(key, "discarding read started before the cache was cleared");
                return outcome.ok();
            }
            if !entries.contains_key(key) {
                self.make_room(&mut entries, &config);
            }
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| CacheEntry::idle(key));

            match outcome {
                Ok(data) => {
                    entry.settle_success(data.clone(), now);
                    Some(data)
                }
                Err(e) => {
                    let counter = if e.is_timeout() {
                        &self.counters.timeouts
                    } else {
                        &self.counters.failures
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    warn!(key, error = %e, stale = entry.data.is_some(), "query failed");
                    entry.settle_error(e, now);
                    None
                }
            }
        };

        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.get(key).is_some_and(|f| f.op == ticket.op) {
                in_flight.remove(key);
            }
        }

        self.notify(key);
        data
    }

    /// Purge one batch when inserting a new key would exceed `max_size`.
    fn make_room(&self, entries: &mut HashMap<String, CacheEntry>, config: &CacheConfig) {
        if entries.len() < config.max_size {
            return;
        }
        let overflow = entries.len() + 1 - config.max_size;
        self.evict_oldest(entries, config.eviction_batch().max(overflow));
    }

    /// Remove up to `count` settled entries, oldest first.
    fn evict_oldest(&self, entries: &mut HashMap<String, CacheEntry>, count: usize) -> usize {
        if count == 0 {
            return 0;
        }

        let mut candidates: Vec<(Timestamp, String)> = entries
            .iter()
            .filter(|(_, entry)| entry.status != QueryStatus::Loading)
            .map(|(key, entry)| (entry.timestamp.unwrap_or(0), key.clone()))
            .collect();
        candidates.sort_unstable();

        let mut evicted = 0;
        for (_, key) in candidates.into_iter().take(count) {
            entries.remove(&key);
            evicted += 1;
        }

        if evicted > 0 {
            self.counters
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, remaining = entries.len(), "evicted oldest cache entries");
        }
        evicted
    }

    fn notify(&self, key: &str) {
        // No receivers is fine.
        let _ = self.updates.send(key.to_string());
    }
}
