//! Skein Crypto - Event authenticity
//!
//! Provides:
//! - Signing keys for authoring events (used by publishers and tests)
//! - Verification of received events (id integrity + signature)

pub mod keys;
pub mod verify;

pub use keys::*;
pub use verify::*;
