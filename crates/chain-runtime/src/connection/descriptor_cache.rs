//! # Descriptor Cache
//!
//! Loaded chain descriptors keyed by descriptor key.
//!
//! Concurrent loads of one key share a single in-flight future. A failed
//! load clears its slot so the next caller starts over.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::domain::{ChainDescriptor, RuntimeError, RuntimeResult};
use crate::ports::DescriptorSource;

type SharedLoad = Shared<BoxFuture<'static, RuntimeResult<Arc<ChainDescriptor>>>>;

enum Slot {
    Loaded(Arc<ChainDescriptor>),
    Loading { id: u64, load: SharedLoad },
}

/// Process-wide store of loaded descriptors.
#[derive(Default)]
pub struct DescriptorCache {
    slots: Mutex<HashMap<String, Slot>>,
    next_load: AtomicU64,
}

static GLOBAL: OnceLock<Arc<DescriptorCache>> = OnceLock::new();

impl DescriptorCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache shared by every runtime in the process.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Return the descriptor for `key`, loading it through `source` at most
    /// once at a time.
    pub async fn get_or_load(
        self: &Arc<Self>,
        key: &str,
        source: Arc<dyn DescriptorSource>,
    ) -> RuntimeResult<Arc<ChainDescriptor>> {
        let load = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(Slot::Loaded(descriptor)) => return Ok(Arc::clone(descriptor)),
                Some(Slot::Loading { load, .. }) => {
                    debug!(key, "joining in-flight descriptor load");
                    load.clone()
                }
                None => {
                    let id = self.next_load.fetch_add(1, Ordering::Relaxed);
                    let load = self.start_load(key.to_string(), id, source);
                    slots.insert(
                        key.to_string(),
                        Slot::Loading {
                            id,
                            load: load.clone(),
                        },
                    );
                    load
                }
            }
        };

        load.await
    }

    fn start_load(
        self: &Arc<Self>,
        key: String,
        id: u64,
        source: Arc<dyn DescriptorSource>,
    ) -> SharedLoad {
        let cache = Arc::downgrade(self);
        async move {
            let result = match source.load(&key).await {
                Ok(descriptor) if descriptor.key != key => Err(RuntimeError::descriptor_load(
                    &key,
                    format!("source returned descriptor '{}'", descriptor.key),
                )),
                Ok(descriptor) => Ok(Arc::new(descriptor)),
                Err(e @ (RuntimeError::UnknownDescriptor(_) | RuntimeError::DescriptorLoad { .. })) => {
                    Err(e)
                }
                Err(e) => Err(RuntimeError::descriptor_load(&key, e)),
            };

            if let Some(cache) = cache.upgrade() {
                cache.settle(&key, id, &result);
            }
            result
        }
        .boxed()
        .shared()
    }

    fn settle(&self, key: &str, id: u64, result: &RuntimeResult<Arc<ChainDescriptor>>) {
        let mut slots = self.slots.lock();
        let owns_slot = matches!(slots.get(key), Some(Slot::Loading { id: current, .. }) if *current == id);
        if !owns_slot {
            return;
        }

        match result {
            Ok(descriptor) => {
                debug!(key, spec_version = descriptor.spec_version, "descriptor loaded");
                slots.insert(key.to_string(), Slot::Loaded(Arc::clone(descriptor)));
            }
            Err(e) => {
                warn!(key, error = %e, "descriptor load failed");
                slots.remove(key);
            }
        }
    }

    /// Descriptor for `key` if already loaded.
    pub fn get(&self, key: &str) -> Option<Arc<ChainDescriptor>> {
        match self.slots.lock().get(key) {
            Some(Slot::Loaded(descriptor)) => Some(Arc::clone(descriptor)),
            _ => None,
        }
    }

    /// Whether a load for `key` is in flight.
    pub fn is_loading(&self, key: &str) -> bool {
        matches!(self.slots.lock().get(key), Some(Slot::Loading { .. }))
    }

    /// Drop the descriptor for `key`; the next request reloads it.
    pub fn invalidate(&self, key: &str) -> bool {
        self.slots.lock().remove(key).is_some()
    }

    /// Drop every descriptor.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::MockDescriptorSource;
    use std::time::Duration;

    fn source() -> Arc<MockDescriptorSource> {
        Arc::new(MockDescriptorSource::new().with_descriptor(ChainDescriptor::new("dev")))
    }

    #[tokio::test]
    async fn test_loads_once_then_serves_cached() {
        let cache = Arc::new(DescriptorCache::new());
        let source = source();

        let a = cache.get_or_load("dev", source.clone()).await.unwrap();
        let b = cache.get_or_load("dev", source.clone()).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(source.load_count(), 1);
        assert!(cache.get("dev").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_share_one_fetch() {
        let cache = Arc::new(DescriptorCache::new());
        let source = source();
        source.set_delay(Duration::from_millis(50));

        let (a, b, c) = tokio::join!(
            cache.get_or_load("dev", source.clone()),
            cache.get_or_load("dev", source.clone()),
            cache.get_or_load("dev", source.clone()),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(source.load_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_resets_slot() {
        let cache = Arc::new(DescriptorCache::new());
        let source = source();
        source.fail_next_loads(1);

        let first = cache.get_or_load("dev", source.clone()).await;
        assert!(matches!(first, Err(RuntimeError::DescriptorLoad { .. })));
        assert!(!cache.is_loading("dev"));
        assert!(cache.get("dev").is_none());

        assert!(cache.get_or_load("dev", source.clone()).await.is_ok());
        assert_eq!(source.load_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let cache = Arc::new(DescriptorCache::new());
        let result = cache.get_or_load("nope", source()).await;
        assert!(matches!(result, Err(RuntimeError::UnknownDescriptor(_))));
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let cache = Arc::new(DescriptorCache::new());
        let source = source();

        cache.get_or_load("dev", source.clone()).await.unwrap();
        assert!(cache.invalidate("dev"));
        cache.get_or_load("dev", source.clone()).await.unwrap();
        assert_eq!(source.load_count(), 2);
    }
}
