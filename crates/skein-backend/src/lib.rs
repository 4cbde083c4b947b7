//! Skein Backend - Execution of subscription requests
//!
//! An execution backend receives `BackendCommand`s, opens the query
//! against every `relay × filter` pair through a `RelayPool`, verifies and
//! deduplicates what comes back, and answers with `BackendReply`s tagged by
//! request id. Two interchangeable implementations share one contract:
//! - `WorkerBackend`: executor on a dedicated thread, message passing only
//! - `InlineBackend`: executor on the caller's runtime
//!
//! `RecordingBackend` is an instrumented double for tests.

pub mod executor;
pub mod inline;
pub mod protocol;
pub mod recording;
pub mod select;
pub mod worker;

pub use executor::*;
pub use inline::*;
pub use protocol::*;
pub use recording::*;
pub use select::*;
pub use worker::*;
