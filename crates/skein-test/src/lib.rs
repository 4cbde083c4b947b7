//! Skein Test Harness - Fixtures, chaos and end-to-end scenarios
//!
//! This crate provides:
//! - Signed event fixtures with deterministic authors
//! - `ChaosRelayPool`: a relay pool wrapper that duplicates, reorders and
//!   drops events
//! - End-to-end scenarios exercising the whole request path

pub mod chaos;
pub mod fixtures;
pub mod scenarios;

pub use chaos::*;
pub use fixtures::*;
pub use scenarios::*;
