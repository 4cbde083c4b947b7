//! Relay pool boundary
//!
//! The pool owns relay connections. Skein only asks it to open a query
//! against one relay and to publish an event; connection health is the
//! pool's business.

use async_trait::async_trait;
use tokio::sync::mpsc;

use skein_core::{Event, Filter, RelayUrl, SkeinResult};

/// Message received from one relay for one open query
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayMessage {
    /// A stored or live event matching the query
    Event(Event),
    /// End of stored events: the relay exhausted its historical backlog
    Eose,
    /// The relay closed the query
    Closed(String),
}

/// Stream of messages for one open query. Dropping it closes the query.
pub type RelayStream = mpsc::Receiver<RelayMessage>;

/// Connection pool over relays
#[async_trait]
pub trait RelayPool: Send + Sync + 'static {
    /// Open a query against a single relay
    async fn subscribe(&self, relay: &RelayUrl, filters: Vec<Filter>) -> SkeinResult<RelayStream>;

    /// Publish an event to a single relay; `Ok(false)` means the relay
    /// answered but refused the event
    async fn publish(&self, relay: &RelayUrl, event: &Event) -> SkeinResult<bool>;
}
