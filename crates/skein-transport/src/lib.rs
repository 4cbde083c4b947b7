//! Skein Transport Layer - Relay pool boundary
//!
//! This crate provides:
//! - The `RelayPool` trait: the connection-pool collaborator that opens
//!   queries against individual relays and publishes events
//! - `MemoryRelayPool`: an in-process relay set for tests and demos

pub mod memory;
pub mod pool;

pub use memory::*;
pub use pool::*;
