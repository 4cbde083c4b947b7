//! Metadata batcher
//!
//! UI rows ask for metadata one id at a time. Requests arriving within one
//! debounce window are folded into a single query with one filter per
//! category, and results are routed back by `category:id`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use tracing::{debug, warn};

use skein_core::{Event, Filter, Kind, ListenerId, PublicKey};

use crate::registry::{run_guarded, BatchId, EventCallback};

/// Kind of metadata looked up by id
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetadataCategory {
    /// Profile (kind 0) by author key
    Profile,
    /// Reactions (kind 7) referencing an event
    Reactions,
    /// Replies (kind 1) referencing an event
    Replies,
    /// Deletions (kind 5) referencing an event
    Deletions,
}

impl MetadataCategory {
    pub const ALL: [MetadataCategory; 4] = [
        MetadataCategory::Profile,
        MetadataCategory::Reactions,
        MetadataCategory::Replies,
        MetadataCategory::Deletions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetadataCategory::Profile => "profile",
            MetadataCategory::Reactions => "reactions",
            MetadataCategory::Replies => "replies",
            MetadataCategory::Deletions => "deletions",
        }
    }

    pub fn kind(self) -> Kind {
        match self {
            MetadataCategory::Profile => Kind::METADATA,
            MetadataCategory::Reactions => Kind::REACTION,
            MetadataCategory::Replies => Kind::TEXT_NOTE,
            MetadataCategory::Deletions => Kind::DELETION,
        }
    }

    /// Combined filter for a set of ids
    pub fn filter(self, ids: &BTreeSet<String>) -> Option<Filter> {
        if ids.is_empty() {
            return None;
        }
        let filter = Filter::new().kind(self.kind());
        match self {
            MetadataCategory::Profile => {
                let authors: Vec<PublicKey> = ids
                    .iter()
                    .filter_map(|id| match PublicKey::from_hex(id) {
                        Ok(key) => Some(key),
                        Err(e) => {
                            warn!(id = %id, "skipping profile lookup: {}", e);
                            None
                        }
                    })
                    .collect();
                if authors.is_empty() {
                    return None;
                }
                Some(filter.authors(authors))
            }
            _ => Some(filter.tag('e', ids.iter().cloned())),
        }
    }

    /// Routing keys an event answers
    fn route_keys(event: &Event) -> Vec<RouteKey> {
        match event.kind {
            Kind::METADATA => vec![RouteKey::new(MetadataCategory::Profile, &event.pubkey.to_hex())],
            kind => {
                let Some(category) = [
                    MetadataCategory::Reactions,
                    MetadataCategory::Replies,
                    MetadataCategory::Deletions,
                ]
                .into_iter()
                .find(|c| c.kind() == kind) else {
                    return Vec::new();
                };
                event
                    .tag_values("e")
                    .map(|id| RouteKey::new(category, id))
                    .collect()
            }
        }
    }
}

impl fmt::Display for MetadataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `category:id`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn new(category: MetadataCategory, id: &str) -> Self {
        RouteKey(format!("{}:{}", category, id.to_ascii_lowercase()))
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One flushed window, ready to be submitted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flush {
    pub batch: BatchId,
    pub filters: Vec<Filter>,
}

/// Debounced by-id metadata lookups
#[derive(Default)]
pub struct MetadataBatcher {
    pending: BTreeMap<MetadataCategory, BTreeSet<String>>,
    listeners: HashMap<RouteKey, Vec<(ListenerId, EventCallback)>>,
    owners: HashMap<ListenerId, RouteKey>,
    window_open: bool,
    /// Open batches and the registry listener holding each open
    batches: HashMap<BatchId, ListenerId>,
    next_batch: BatchId,
}

impl MetadataBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in one id.
    ///
    /// Returns true if this request opened a new window, in which case the
    /// caller must arm the flush timer.
    pub fn request(
        &mut self,
        category: MetadataCategory,
        id: &str,
        listener: ListenerId,
        on_result: EventCallback,
    ) -> bool {
        let id = id.to_ascii_lowercase();
        let route = RouteKey::new(category, &id);

        self.pending.entry(category).or_default().insert(id);
        self.listeners
            .entry(route.clone())
            .or_default()
            .push((listener, on_result));
        self.owners.insert(listener, route);

        if self.window_open {
            return false;
        }
        self.window_open = true;
        true
    }

    /// Close the window. Returns the combined query, if anything was
    /// pending; the pending sets are cleared either way.
    pub fn flush(&mut self) -> Option<Flush> {
        self.window_open = false;
        let pending = std::mem::take(&mut self.pending);

        let filters: Vec<Filter> = pending
            .iter()
            .filter_map(|(category, ids)| category.filter(ids))
            .collect();
        if filters.is_empty() {
            return None;
        }

        self.next_batch += 1;
        let batch = self.next_batch;
        debug!(
            batch,
            categories = filters.len(),
            ids = pending.values().map(BTreeSet::len).sum::<usize>(),
            "metadata window flushed"
        );
        Some(Flush { batch, filters })
    }

    /// Record the registry listener that keeps a batch open
    pub fn open_batch(&mut self, batch: BatchId, subscription: ListenerId) {
        self.batches.insert(batch, subscription);
    }

    /// Forget a batch; returns its registry listener to close
    pub fn close_batch(&mut self, batch: BatchId) -> Option<ListenerId> {
        self.batches.remove(&batch)
    }

    /// Deliver an event to every listener of the routes it answers
    pub fn route(&self, event: &Event) -> usize {
        let mut delivered = 0;
        for key in MetadataCategory::route_keys(event) {
            let Some(listeners) = self.listeners.get(&key) else {
                continue;
            };
            for (_, on_result) in listeners {
                let on_result = on_result.clone();
                run_guarded(&key, move || on_result(event));
                delivered += 1;
            }
        }
        delivered
    }

    pub fn remove(&mut self, listener: ListenerId) -> bool {
        let Some(route) = self.owners.remove(&listener) else {
            return false;
        };
        if let Some(listeners) = self.listeners.get_mut(&route) {
            listeners.retain(|(id, _)| *id != listener);
            if listeners.is_empty() {
                self.listeners.remove(&route);
            }
        }
        true
    }

    pub fn is_window_open(&self) -> bool {
        self.window_open
    }

    /// Ids waiting for the current window, per category
    pub fn pending(&self, category: MetadataCategory) -> Vec<String> {
        self.pending
            .get(&category)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn open_batches(&self) -> usize {
        self.batches.len()
    }

    /// Drop all state; returns registry listeners of open batches
    pub fn drain(&mut self) -> Vec<ListenerId> {
        self.pending.clear();
        self.listeners.clear();
        self.owners.clear();
        self.window_open = false;
        self.batches.drain().map(|(_, l)| l).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use skein_core::{EventId, Signature, Timestamp, UnsignedEvent};
    use std::sync::Arc;

    fn author(n: u8) -> PublicKey {
        PublicKey::from_bytes([n; 32])
    }

    fn signed_by(pubkey: PublicKey, kind: Kind) -> UnsignedEvent {
        UnsignedEvent::new(pubkey, Timestamp(10), kind, "{}")
    }

    fn finish(unsigned: UnsignedEvent) -> Event {
        let id = unsigned.id();
        unsigned.into_event(id, Signature::from_bytes([0; 64]))
    }

    fn counter() -> (Arc<Mutex<usize>>, EventCallback) {
        let hits = Arc::new(Mutex::new(0));
        let c = hits.clone();
        (hits, Arc::new(move |_: &Event| *c.lock() += 1))
    }

    #[test]
    fn test_window_coalesces_requests() {
        let mut batcher = MetadataBatcher::new();
        let (_, cb) = counter();

        assert!(batcher.request(MetadataCategory::Profile, &author(1).to_hex(), ListenerId::new(1), cb.clone()));
        assert!(!batcher.request(MetadataCategory::Profile, &author(2).to_hex(), ListenerId::new(2), cb.clone()));

        let flush = batcher.flush().unwrap();
        assert_eq!(flush.filters.len(), 1);
        assert_eq!(flush.filters[0].authors.as_ref().map(Vec::len), Some(2));

        // A request after the flush opens a new window
        assert!(batcher.request(MetadataCategory::Profile, &author(3).to_hex(), ListenerId::new(3), cb));
        assert_eq!(batcher.flush().unwrap().batch, flush.batch + 1);
    }

    #[test]
    fn test_one_filter_per_category() {
        let mut batcher = MetadataBatcher::new();
        let (_, cb) = counter();
        let target = EventId::from_bytes([5; 32]).to_hex();

        batcher.request(MetadataCategory::Profile, &author(1).to_hex(), ListenerId::new(1), cb.clone());
        batcher.request(MetadataCategory::Reactions, &target, ListenerId::new(2), cb.clone());
        batcher.request(MetadataCategory::Deletions, &target, ListenerId::new(3), cb);

        let flush = batcher.flush().unwrap();
        assert_eq!(flush.filters.len(), 3);
        assert!(batcher.pending(MetadataCategory::Reactions).is_empty());
    }

    #[test]
    fn test_empty_window_flushes_nothing() {
        let mut batcher = MetadataBatcher::new();
        assert_eq!(batcher.flush(), None);

        let (_, cb) = counter();
        batcher.request(MetadataCategory::Profile, "not-hex", ListenerId::new(1), cb);
        assert_eq!(batcher.flush(), None);
    }

    #[test]
    fn test_routes_by_category_and_id() {
        let mut batcher = MetadataBatcher::new();
        let target = EventId::from_bytes([5; 32]);
        let (profile_hits, profile_cb) = counter();
        let (reaction_hits, reaction_cb) = counter();

        batcher.request(MetadataCategory::Profile, &author(1).to_hex(), ListenerId::new(1), profile_cb);
        batcher.request(MetadataCategory::Reactions, &target.to_hex(), ListenerId::new(2), reaction_cb);

        let profile = finish(signed_by(author(1), Kind::METADATA));
        let other_profile = finish(signed_by(author(2), Kind::METADATA));
        let reaction = finish(signed_by(author(9), Kind::REACTION).tag(["e", target.to_hex().as_str()]));
        let reply = finish(signed_by(author(9), Kind::TEXT_NOTE).tag(["e", target.to_hex().as_str()]));

        assert_eq!(batcher.route(&profile), 1);
        assert_eq!(batcher.route(&other_profile), 0);
        assert_eq!(batcher.route(&reaction), 1);
        assert_eq!(batcher.route(&reply), 0);
        assert_eq!(*profile_hits.lock(), 1);
        assert_eq!(*reaction_hits.lock(), 1);

        assert!(batcher.remove(ListenerId::new(1)));
        assert_eq!(batcher.route(&profile), 0);
    }

    #[test]
    fn test_batches_tracked_until_closed() {
        let mut batcher = MetadataBatcher::new();
        batcher.open_batch(1, ListenerId::new(50));
        assert_eq!(batcher.open_batches(), 1);
        assert_eq!(batcher.close_batch(1), Some(ListenerId::new(50)));
        assert_eq!(batcher.close_batch(1), None);
    }
}
