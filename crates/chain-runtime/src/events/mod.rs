//! # Events Module
//!
//! Logical event subscriptions and the bounded event log, plus the scoped
//! guards that pump node events into it.

pub mod registry;
pub mod scope;

pub use registry::EventRegistry;
pub use scope::{EventSubscriptionScope, SubscriptionScopes};
