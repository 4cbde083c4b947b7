//! Seen-id windows for event deduplication
//!
//! Independent relays routinely return the same event. A bounded `SeenSet`
//! remembers the most recent ids it accepted, evicting the oldest once full;
//! backends use it as a cheap first pass. An unbounded set never forgets and
//! is what guarantees at-most-once delivery per logical subscription.

use std::collections::{HashSet, VecDeque};

use crate::EventId;

/// Default window size used by backend dedup
pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

/// Bounded first-accepted-wins id filter
#[derive(Clone, Debug)]
pub struct SeenSet {
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
    /// `None` keeps every id
    capacity: Option<usize>,
}

impl SeenSet {
    /// Create a new window holding at most `capacity` ids
    pub fn new(capacity: usize) -> Self {
        SeenSet {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: Some(capacity.max(1)),
        }
    }

    /// Create a set that keeps every id for its whole lifetime
    pub fn unbounded() -> Self {
        SeenSet {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: None,
        }
    }

    /// Check whether an id has been accepted (and not yet evicted)
    pub fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    /// Mark an id as seen.
    /// Returns true if accepted, false if duplicate.
    pub fn insert(&mut self, id: EventId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        let Some(capacity) = self.capacity else {
            return true;
        };
        self.order.push_back(id);
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}
