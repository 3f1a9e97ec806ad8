//! # Application Module
//!
//! The runtime facade orchestrating connection, cache and event registry.

pub mod runtime;

pub use runtime::{ChainRuntime, ChainRuntimeBuilder};
