//! # Cache Domain Types
//!
//! Entries, policy and snapshot shapes for the query cache.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::errors::{RuntimeError, RuntimeResult};

/// Wall-clock timestamp in milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Default freshness window for success entries.
pub const DEFAULT_CACHE_TTL_MS: u64 = 30_000;

/// Default entry bound before batch eviction kicks in.
pub const DEFAULT_CACHE_MAX_SIZE: usize = 1000;

/// Default read timeout.
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 180_000;

/// Share of entries purged in one eviction batch, in percent.
pub const EVICTION_BATCH_PERCENT: usize = 10;

/// Snapshot format version written by this crate.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Lifecycle of a cache entry: idle → loading → (success | error).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Never queried.
    #[default]
    Idle,
    /// A user-visible read is in progress.
    Loading,
    /// The last read succeeded.
    Success,
    /// The last read failed. Earlier data, if any, is retained.
    Error,
}

/// One cached read.
///
/// `status == Success` iff the last settle produced data with no error;
/// `status == Error` iff the last settle produced an error. Data from an
/// earlier success survives a later error.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry<T = serde_json::Value> {
    /// Opaque cache key.
    pub key: String,
    /// Last successful data.
    pub data: Option<T>,
    /// Lifecycle status.
    pub status: QueryStatus,
    /// Error of the last settle, if it failed.
    pub error: Option<RuntimeError>,
    /// When the entry last settled.
    pub timestamp: Option<Timestamp>,
}

/// What the binding layer renders: the entry as currently stored.
pub type QueryResult<T = serde_json::Value> = CacheEntry<T>;

impl<T> CacheEntry<T> {
    /// Placeholder for a key that was never queried.
    pub fn idle(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data: None,
            status: QueryStatus::Idle,
            error: None,
            timestamp: None,
        }
    }

    /// Milliseconds since the entry last settled.
    pub fn age(&self, now: Timestamp) -> Option<u64> {
        self.timestamp.map(|ts| now.saturating_sub(ts))
    }

    /// Success entry younger than `ttl_ms`.
    pub fn is_fresh(&self, now: Timestamp, ttl_ms: u64) -> bool {
        self.status == QueryStatus::Success
            && self.data.is_some()
            && self.age(now).is_some_and(|age| age < ttl_ms)
    }

    /// Flip to loading, keeping any earlier data visible.
    pub fn mark_loading(&mut self) {
        self.status = QueryStatus::Loading;
    }

    /// Settle with fresh data.
    pub fn settle_success(&mut self, data: T, now: Timestamp) {
        self.data = Some(data);
        self.status = QueryStatus::Success;
        self.error = None;
        self.timestamp = Some(now);
    }

    /// Settle with a failure. Earlier data is retained.
    pub fn settle_error(&mut self, error: RuntimeError, now: Timestamp) {
        self.status = QueryStatus::Error;
        self.error = Some(error);
        self.timestamp = Some(now);
    }

    /// Whether this entry may be written to a snapshot.
    pub fn is_persistable(&self) -> bool {
        self.status == QueryStatus::Success && self.data.is_some()
    }
}

impl CacheEntry<serde_json::Value> {
    /// Decode the stored JSON into a typed entry.
    pub fn decode<T: DeserializeOwned>(self) -> RuntimeResult<CacheEntry<T>> {
        let data = match self.data {
            Some(value) => Some(serde_json::from_value(value)?),
            None => None,
        };
        Ok(CacheEntry {
            key: self.key,
            data,
            status: self.status,
            error: self.error,
            timestamp: self.timestamp,
        })
    }
}

/// Cache policy, live-tunable per cache instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Maximum age of a success entry before it is refetched.
    pub ttl_ms: u64,
    /// Entry bound; inserting past it purges the oldest batch.
    pub max_size: usize,
    /// Default read timeout.
    pub timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_CACHE_TTL_MS,
            max_size: DEFAULT_CACHE_MAX_SIZE,
            timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
        }
    }
}

impl CacheConfig {
    /// Reject policies the cache cannot honour.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.max_size == 0 {
            return Err(RuntimeError::Config("cache max_size cannot be 0".into()));
        }
        if self.timeout_ms == 0 {
            return Err(RuntimeError::Config("query timeout cannot be 0".into()));
        }
        Ok(())
    }

    /// Default read timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Apply a partial update.
    pub fn apply(&mut self, update: &CacheConfigUpdate) {
        if let Some(ttl_ms) = update.ttl_ms {
            self.ttl_ms = ttl_ms;
        }
        if let Some(max_size) = update.max_size {
            self.max_size = max_size;
        }
        if let Some(timeout_ms) = update.timeout_ms {
            self.timeout_ms = timeout_ms;
        }
    }

    /// Entries purged by one eviction batch (10%, at least one).
    pub fn eviction_batch(&self) -> usize {
        (self.max_size * EVICTION_BATCH_PERCENT).div_ceil(100).max(1)
    }
}

/// Partial cache policy update; unset fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfigUpdate {
    /// New ttl.
    pub ttl_ms: Option<u64>,
    /// New entry bound.
    pub max_size: Option<usize>,
    /// New default timeout.
    pub timeout_ms: Option<u64>,
}

/// Per-call options for `execute_query`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Ignore fresh entries and pending reads; always run the read.
    pub force: bool,
    /// Refresh data without flipping the entry to `Loading`.
    pub background: bool,
    /// Override the cache-wide timeout.
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    /// Options with every flag off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `force`.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Set `background`.
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Override the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Cache key construction.
pub struct QueryKey;

impl QueryKey {
    /// Key for a logical read path plus serialized parameters:
    /// `path(<json>)`.
    pub fn new(path: &str, params: &serde_json::Value) -> String {
        format!("{path}({params})")
    }

    /// Key for a storage read: `Section.Item(<json>)`.
    pub fn storage(section: &str, item: &str, params: &serde_json::Value) -> String {
        Self::new(&format!("{section}.{item}"), params)
    }
}

/// One success entry as written to a snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    /// Cached data.
    pub data: serde_json::Value,
    /// When it settled.
    pub timestamp: Timestamp,
}

/// Opaque cache snapshot: successful entries plus current policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    /// Format version.
    pub version: u32,
    /// Cache policy at the time of the snapshot.
    pub policy: CacheConfig,
    /// Successful entries by key.
    pub entries: BTreeMap<String, PersistedEntry>,
}

impl Default for CacheSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            policy: CacheConfig::default(),
            entries: BTreeMap::new(),
        }
    }
}
