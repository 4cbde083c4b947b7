//! Feed registry
//!
//! A feed entry is a bounded buffer of the most recent events of one query,
//! kept live by a background shared subscription. It serves two kinds of
//! consumers:
//! - live listeners, called for every event the buffer accepts
//! - snapshot resolvers, answered once with the buffer contents
//!
//! An entry lives while it has either kind of consumer.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::debug;

use skein_core::{CanonicalKey, Event, FeedBuffer, Filter, ListenerId, RelayUrl};

use crate::registry::{run_guarded, EventCallback, ListenerIds};

/// What a feed shows.
///
/// Unnamed feeds are identified by `(filters, relays, limit)`; named feeds
/// by their name, so registering the name again with another limit
/// resizes the existing feed.
#[derive(Clone, Debug, Default)]
pub struct FeedRequest {
    pub name: Option<String>,
    pub filters: Vec<Filter>,
    /// `None` selects the default relay set
    pub relays: Option<Vec<RelayUrl>>,
    pub limit: usize,
}

impl FeedRequest {
    pub fn new(filters: Vec<Filter>, limit: usize) -> Self {
        FeedRequest {
            name: None,
            filters,
            relays: None,
            limit,
        }
    }

    pub fn relays(mut self, relays: Vec<RelayUrl>) -> Self {
        self.relays = Some(relays);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Feed key given the normalized relay set
    pub fn key(&self, relays: &[RelayUrl]) -> CanonicalKey {
        match &self.name {
            Some(name) => CanonicalKey::named(name),
            None => CanonicalKey::feed(&self.filters, relays, self.limit),
        }
    }
}

/// One logical feed
pub struct FeedEntry {
    pub key: CanonicalKey,
    pub filters: Vec<Filter>,
    pub relays: Vec<RelayUrl>,
    buffer: FeedBuffer,
    listeners: Vec<(ListenerId, EventCallback)>,
    resolvers: Vec<(ListenerId, oneshot::Sender<Vec<Event>>)>,
    /// Registry listener of the background subscription
    subscription: ListenerId,
    /// The background subscription exhausted its backlog
    completed: bool,
}

impl FeedEntry {
    pub fn snapshot(&self) -> Vec<Event> {
        self.buffer.snapshot()
    }

    pub fn limit(&self) -> usize {
        self.buffer.limit()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn pending_snapshots(&self) -> usize {
        self.resolvers.len()
    }

    fn is_unused(&self) -> bool {
        self.listeners.is_empty() && self.resolvers.is_empty()
    }

    fn resolve_all(&mut self) {
        let snapshot = self.buffer.snapshot();
        for (_, tx) in self.resolvers.drain(..) {
            // The requester may have stopped waiting
            let _ = tx.send(snapshot.clone());
        }
    }
}

/// Result of [`FeedRegistry::ensure`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedSlot {
    /// A new entry; its background subscription must be opened with the
    /// given registry listener id
    Created(ListenerId),
    /// The entry's query changed: close `previous`, then open the new
    /// background subscription as `subscription`
    Requeried {
        previous: ListenerId,
        subscription: ListenerId,
    },
    Existing,
}

/// Registry of feed entries keyed by feed key
#[derive(Default)]
pub struct FeedRegistry {
    entries: HashMap<CanonicalKey, FeedEntry>,
    owners: HashMap<ListenerId, CanonicalKey>,
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure an entry exists for `key`, creating or updating its
    /// parameters.
    ///
    /// An existing entry registered with another limit adopts the new one.
    /// New filters or relays replace the query: the buffer starts over and
    /// waiting snapshots wait for the new backlog.
    pub fn ensure(
        &mut self,
        key: &CanonicalKey,
        filters: Vec<Filter>,
        relays: Vec<RelayUrl>,
        limit: usize,
        ids: &ListenerIds,
    ) -> FeedSlot {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.filters != filters || entry.relays != relays {
                debug!(feed = %key, limit, "feed query changed");
                let previous = entry.subscription;
                entry.filters = filters;
                entry.relays = relays;
                entry.buffer = FeedBuffer::new(limit);
                entry.completed = false;
                entry.subscription = ids.next();
                return FeedSlot::Requeried {
                    previous,
                    subscription: entry.subscription,
                };
            }
            if entry.buffer.limit() != limit {
                debug!(feed = %key, from = entry.buffer.limit(), to = limit, "feed limit changed");
                entry.buffer.set_limit(limit);
            }
            return FeedSlot::Existing;
        }

        let subscription = ids.next();
        debug!(feed = %key, limit, "new feed entry");
        self.entries.insert(
            key.clone(),
            FeedEntry {
                key: key.clone(),
                filters,
                relays,
                buffer: FeedBuffer::new(limit),
                listeners: Vec::new(),
                resolvers: Vec::new(),
                subscription,
                completed: false,
            },
        );
        FeedSlot::Created(subscription)
    }

    /// Add a live listener to an existing entry
    pub fn add_listener(&mut self, key: &CanonicalKey, listener: ListenerId, on_event: EventCallback) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.listeners.push((listener, on_event));
        self.owners.insert(listener, key.clone());
        true
    }

    /// Add a snapshot resolver. If the entry already completed it is
    /// answered at once and `None` is returned; otherwise the resolver waits
    /// and its id is returned so the caller can arm a timeout.
    pub fn add_resolver(
        &mut self,
        key: &CanonicalKey,
        resolver: ListenerId,
        tx: oneshot::Sender<Vec<Event>>,
    ) -> Option<ListenerId> {
        let Some(entry) = self.entries.get_mut(key) else {
            let _ = tx.send(Vec::new());
            return None;
        };
        if entry.completed {
            let _ = tx.send(entry.buffer.snapshot());
            return None;
        }
        entry.resolvers.push((resolver, tx));
        self.owners.insert(resolver, key.clone());
        Some(resolver)
    }

    /// Buffer a live event and pass it on to live listeners if accepted
    pub fn on_event(&mut self, key: &CanonicalKey, event: &Event) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if !entry.buffer.insert(event.clone()) {
            return false;
        }
        for (_, on_event) in &entry.listeners {
            let on_event = on_event.clone();
            run_guarded(key, move || on_event(event));
        }
        true
    }

    /// The background subscription completed: answer every waiting
    /// snapshot. Returns the subscription listener to close if the entry
    /// became unused.
    pub fn on_complete(&mut self, key: &CanonicalKey) -> Option<ListenerId> {
        let entry = self.entries.get_mut(key)?;
        entry.completed = true;
        let answered: Vec<ListenerId> = entry.resolvers.iter().map(|(id, _)| *id).collect();
        entry.resolve_all();
        if !answered.is_empty() {
            debug!(feed = %key, resolved = answered.len(), "snapshots served on completion");
        }
        for id in &answered {
            self.owners.remove(id);
        }
        self.collect(key)
    }

    /// Snapshot timeout: answer one resolver with whatever is buffered
    pub fn resolve(&mut self, key: &CanonicalKey, resolver: ListenerId) -> Option<ListenerId> {
        let entry = self.entries.get_mut(key)?;
        let pos = entry.resolvers.iter().position(|(id, _)| *id == resolver)?;
        let (_, tx) = entry.resolvers.remove(pos);
        debug!(feed = %key, buffered = entry.buffer.len(), "snapshot timed out, serving partial buffer");
        let _ = tx.send(entry.buffer.snapshot());
        self.owners.remove(&resolver);
        self.collect(key)
    }

    /// Remove a live listener or a pending resolver. Returns the
    /// subscription listener to close if the entry became unused.
    pub fn remove(&mut self, id: ListenerId) -> Option<ListenerId> {
        let key = self.owners.remove(&id)?;
        let entry = self.entries.get_mut(&key)?;
        entry.listeners.retain(|(l, _)| *l != id);
        entry.resolvers.retain(|(r, _)| *r != id);
        self.collect(&key)
    }

    pub fn get(&self, key: &CanonicalKey) -> Option<&FeedEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry; pending snapshots get the current buffer
    pub fn drain(&mut self) {
        for (_, mut entry) in self.entries.drain() {
            entry.resolve_all();
        }
        self.owners.clear();
    }

    fn collect(&mut self, key: &CanonicalKey) -> Option<ListenerId> {
        if !self.entries.get(key)?.is_unused() {
            return None;
        }
        let entry = self.entries.remove(key)?;
        debug!(feed = %key, "feed entry released");
        Some(entry.subscription)
    }
}
