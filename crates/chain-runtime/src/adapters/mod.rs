//! # Adapters
//!
//! Concrete implementations of the outbound ports: the WebSocket JSON-RPC
//! transport, descriptor sources and the file snapshot store.

pub mod descriptors;
pub mod snapshot;
pub mod ws;

pub use descriptors::{FileDescriptorSource, StaticDescriptorSource};
pub use snapshot::FileSnapshotStore;
pub use ws::{WsTransport, WsTransportFactory, DEFAULT_REQUEST_TIMEOUT};
