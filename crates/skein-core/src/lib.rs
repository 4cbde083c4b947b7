//! Skein Core - Fundamental types and primitives
//!
//! This crate defines the value types shared by every layer of the
//! subscription multiplexer:
//! - Identifiers (EventId, PublicKey, RequestId, ListenerId)
//! - Events, kinds and tags
//! - Query filters and relay addresses
//! - Canonical request keys
//! - Bounded feed buffers and dedup windows

pub mod class;
pub mod dedup;
pub mod error;
pub mod event;
pub mod feed;
pub mod filter;
pub mod id;
pub mod key;
pub mod relay;
pub mod time;

pub use class::*;
pub use dedup::*;
pub use error::*;
pub use event::*;
pub use feed::*;
pub use filter::*;
pub use id::*;
pub use key::*;
pub use relay::*;
pub use time::*;
