//! # Connection Module
//!
//! Connection lifecycle: the manager state machine, the retry policy, the
//! shared descriptor cache and the typed API derived from a live transport.

pub mod descriptor_cache;
pub mod manager;
pub mod retry;
pub mod typed_api;

pub use descriptor_cache::DescriptorCache;
pub use manager::{ConnectHandle, ConnectionManager};
pub use retry::RetryPolicy;
pub use typed_api::{
    RawEventStream, TypedApi, EVENTS_SUBSCRIBE_METHOD, EVENTS_UNSUBSCRIBE_METHOD, STORAGE_METHOD,
    SUBMIT_METHOD,
};
