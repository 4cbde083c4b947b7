//! Pagination beyond the live buffer
//!
//! Older pages are fetched with one-shot queries bounded above by the
//! oldest event the caller already holds, and merged into a view the caller
//! owns. Feed buffers are never touched.

use std::collections::HashSet;

use tracing::debug;

use skein_core::{Event, EventId, Filter, RelayUrl};

use crate::Skein;

/// Caller-owned accumulated view of a feed, in feed order
#[derive(Clone, Debug, Default)]
pub struct FeedView {
    events: Vec<Event>,
    ids: HashSet<EventId>,
}

impl FeedView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a snapshot
    pub fn from_events(events: impl IntoIterator<Item = Event>) -> Self {
        let mut view = Self::new();
        view.merge(events);
        view
    }

    /// Merge events, skipping ids already held. Returns how many were new.
    pub fn merge(&mut self, events: impl IntoIterator<Item = Event>) -> usize {
        let before = self.events.len();
        for event in events {
            if self.ids.insert(event.id) {
                self.events.push(event);
            }
        }
        let added = self.events.len() - before;
        if added > 0 {
            self.events.sort_by(Event::feed_order);
        }
        added
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn oldest(&self) -> Option<&Event> {
        self.events.last()
    }

    pub fn newest(&self) -> Option<&Event> {
        self.events.first()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Filters for the page before the oldest event `view` holds.
///
/// `until` is inclusive so events sharing the oldest second are not lost.
/// The limit grows by the number of held events at that second, so every
/// page has room for `page` events the view does not have yet.
pub fn older_page(filters: &[Filter], view: &FeedView, page: usize) -> Vec<Filter> {
    let bound = view.oldest().map(|oldest| {
        let siblings = view
            .events()
            .iter()
            .rev()
            .take_while(|e| e.created_at == oldest.created_at)
            .count();
        (oldest.created_at, siblings)
    });

    filters
        .iter()
        .map(|filter| match bound {
            Some((until, siblings)) => filter.clone().limit(page + siblings).until(until),
            None => filter.clone().limit(page),
        })
        .collect()
}

impl Skein {
    /// Fetch the page of events before the oldest one in `view` and merge
    /// it in. Returns how many new events arrived.
    pub async fn fetch_older(
        &self,
        filters: Vec<Filter>,
        relays: Option<Vec<RelayUrl>>,
        view: &mut FeedView,
        page: usize,
    ) -> usize {
        if page == 0 {
            return 0;
        }
        let filters = older_page(&filters, view, page);
        let events = self.query(filters, relays, self.config().snapshot_timeout).await;
        let fetched = events.len();
        let added = view.merge(events);
        debug!(fetched, added, held = view.len(), "older page merged");
        added
    }
}
