//! Skein Runtime - Subscription multiplexing and feed distribution
//!
//! Turns many overlapping data requests into a bounded set of network
//! subscriptions:
//! 1. Build the canonical key of the request
//! 2. Find or create the shared subscription for that key
//! 3. Queue new subscriptions for admission by priority
//! 4. Admit under the concurrency ceiling, paced in bursts
//! 5. Execute on the backend (worker thread or in-process)
//! 6. Fan results out to every listener, feed buffer and metadata route
//! 7. Tear down when the last listener leaves
//!
//! All bookkeeping lives in [`Multiplexer`], owned by a single control task.
//! [`Skein`] is the cloneable handle callers use.

pub mod batcher;
pub mod config;
pub mod discovery;
pub mod feed;
pub mod multiplexer;
pub mod paging;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod telemetry;

pub use batcher::*;
pub use config::*;
pub use discovery::*;
pub use feed::*;
pub use multiplexer::*;
pub use paging::*;
pub use registry::*;
pub use scheduler::*;
pub use service::*;
pub use telemetry::*;
