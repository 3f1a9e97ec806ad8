//! # Domain Module
//!
//! Core value types for the chain runtime: network descriptions, connection
//! state, chain descriptors, cache entries, events and the error taxonomy.

pub mod cache;
pub mod descriptor;
pub mod errors;
pub mod events;
pub mod network;
pub mod state;

pub use cache::*;
pub use descriptor::*;
pub use errors::*;
pub use events::*;
pub use network::*;
pub use state::*;
