//! In-memory relay set
//!
//! Each relay keeps a stored event list and a live broadcast channel.
//! Queries replay matching stored events newest first (honouring each
//! filter's `limit`), send EOSE, then stream matching live events until the
//! receiver is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use skein_core::{Event, EventId, Filter, RelayUrl, SkeinError, SkeinResult};

use crate::{RelayMessage, RelayPool, RelayStream};

/// Buffered messages per open query
const QUERY_BUFFER: usize = 256;

/// Live broadcast capacity per relay
const LIVE_BUFFER: usize = 1024;

struct RelayState {
    events: Vec<Event>,
    ids: HashSet<EventId>,
    live: broadcast::Sender<Event>,
    online: bool,
    accepts_writes: bool,
    queries_opened: u64,
}

impl RelayState {
    fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_BUFFER);
        RelayState {
            events: Vec::new(),
            ids: HashSet::new(),
            live,
            online: true,
            accepts_writes: true,
            queries_opened: 0,
        }
    }

    fn store(&mut self, event: Event) -> bool {
        if !self.ids.insert(event.id) {
            return false;
        }
        self.events.push(event);
        true
    }

    fn stored_matching(&self, filters: &[Filter]) -> Vec<Event> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for filter in filters {
            let mut hits: Vec<&Event> = self.events.iter().filter(|e| filter.matches(e)).collect();
            hits.sort_by(|a, b| Event::feed_order(a, b));
            if let Some(limit) = filter.limit {
                hits.truncate(limit);
            }
            for event in hits {
                if seen.insert(event.id) {
                    out.push(event.clone());
                }
            }
        }
        out
    }
}

/// In-process relay set implementing [`RelayPool`]
#[derive(Clone, Default)]
pub struct MemoryRelayPool {
    relays: Arc<Mutex<HashMap<RelayUrl, RelayState>>>,
}

impl MemoryRelayPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool with the given relays online
    pub fn with_relays<'a>(relays: impl IntoIterator<Item = &'a RelayUrl>) -> Self {
        let pool = Self::new();
        for relay in relays {
            pool.add_relay(relay);
        }
        pool
    }

    /// Add a relay (no-op if it exists)
    pub fn add_relay(&self, relay: &RelayUrl) {
        self.relays
            .lock()
            .entry(relay.clone())
            .or_insert_with(RelayState::new);
    }

    /// Seed a relay's history without notifying live queries
    pub fn insert(&self, relay: &RelayUrl, event: Event) {
        let mut relays = self.relays.lock();
        relays
            .entry(relay.clone())
            .or_insert_with(RelayState::new)
            .store(event);
    }

    /// Take a relay offline: new queries and publishes fail to connect
    pub fn set_online(&self, relay: &RelayUrl, online: bool) {
        if let Some(state) = self.relays.lock().get_mut(relay) {
            state.online = online;
        }
    }

    /// Make a relay refuse (or accept) published events
    pub fn set_accepts_writes(&self, relay: &RelayUrl, accepts: bool) {
        if let Some(state) = self.relays.lock().get_mut(relay) {
            state.accepts_writes = accepts;
        }
    }

    /// Number of queries ever opened against a relay
    pub fn queries_opened(&self, relay: &RelayUrl) -> u64 {
        self.relays
            .lock()
            .get(relay)
            .map(|s| s.queries_opened)
            .unwrap_or(0)
    }

    /// Stored events of a relay
    pub fn stored(&self, relay: &RelayUrl) -> Vec<Event> {
        self.relays
            .lock()
            .get(relay)
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RelayPool for MemoryRelayPool {
    async fn subscribe(&self, relay: &RelayUrl, filters: Vec<Filter>) -> SkeinResult<RelayStream> {
        let (stored, mut live) = {
            let mut relays = self.relays.lock();
            let state = relays
                .get_mut(relay)
                .filter(|s| s.online)
                .ok_or_else(|| SkeinError::ConnectionFailed(relay.to_string()))?;
            state.queries_opened += 1;
            // Subscribe to live before snapshotting history so nothing
            // published in between is lost.
            let live = state.live.subscribe();
            (state.stored_matching(&filters), live)
        };

        let (tx, rx) = mpsc::channel(QUERY_BUFFER);
        let relay = relay.clone();

        tokio::spawn(async move {
            for event in stored {
                if tx.send(RelayMessage::Event(event)).await.is_err() {
                    return; // Receiver dropped
                }
            }
            if tx.send(RelayMessage::Eose).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    received = live.recv() => match received {
                        Ok(event) => {
                            if filters.iter().any(|f| f.matches(&event))
                                && tx.send(RelayMessage::Event(event)).await.is_err()
                            {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(relay = %relay, skipped, "live query lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = tx.send(RelayMessage::Closed("relay shut down".into())).await;
                            return;
                        }
                    },
                }
            }
        });

        Ok(rx)
    }

    async fn publish(&self, relay: &RelayUrl, event: &Event) -> SkeinResult<bool> {
        let mut relays = self.relays.lock();
        let state = relays
            .get_mut(relay)
            .filter(|s| s.online)
            .ok_or_else(|| SkeinError::ConnectionFailed(relay.to_string()))?;

        if !state.accepts_writes {
            return Ok(false);
        }
        if state.store(event.clone()) {
            // No live receivers is fine
            let _ = state.live.send(event.clone());
        }
        Ok(true)
    }
}
