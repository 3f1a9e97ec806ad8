//! # Query Module
//!
//! Deduplicating read cache in front of the node.

pub mod cache;

pub use cache::{CacheStats, QueryCache};
