//! # Ports Module
//!
//! Hexagonal architecture ports.
//!
//! - `inbound`: API the runtime exposes to host applications
//! - `outbound`: dependencies the runtime needs (transport, descriptors,
//!   snapshot storage, time)

pub mod inbound;
pub mod outbound;

pub use inbound::*;
pub use outbound::*;
