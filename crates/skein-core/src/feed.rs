//! Bounded feed buffers
//!
//! A feed buffer holds the most recent events of one logical feed, newest
//! first, never more than `limit` of them. Arrival order is not trusted:
//! the buffer is re-sorted by `(created_at desc, id asc)` whenever it
//! evicts and whenever a snapshot is taken.

use std::collections::{HashSet, VecDeque};

use crate::{Event, EventId};

/// Bounded, deduplicating, most-recent-first event buffer
#[derive(Clone, Debug)]
pub struct FeedBuffer {
    events: VecDeque<Event>,
    seen: HashSet<EventId>,
    limit: usize,
}

impl FeedBuffer {
    /// Create a new buffer capped at `limit` events
    pub fn new(limit: usize) -> Self {
        FeedBuffer {
            events: VecDeque::with_capacity(limit.min(1024)),
            seen: HashSet::new(),
            limit,
        }
    }

    /// Insert a live event.
    ///
    /// Returns true if the event was accepted and is held by the buffer.
    /// Duplicates are rejected. When the buffer is at capacity the oldest
    /// event is evicted; an incoming event older than everything held is
    /// rejected outright.
    pub fn insert(&mut self, event: Event) -> bool {
        if self.limit == 0 || self.seen.contains(&event.id) {
            return false;
        }

        let id = event.id;
        self.seen.insert(id);
        self.events.push_front(event);

        if self.events.len() > self.limit {
            self.events.make_contiguous().sort_by(Event::feed_order);
            while self.events.len() > self.limit {
                if let Some(evicted) = self.events.pop_back() {
                    self.seen.remove(&evicted.id);
                }
            }
        }

        self.seen.contains(&id)
    }

    /// Change the cap, truncating the oldest events if it shrank
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        if self.events.len() > limit {
            self.events.make_contiguous().sort_by(Event::feed_order);
            while self.events.len() > limit {
                if let Some(evicted) = self.events.pop_back() {
                    self.seen.remove(&evicted.id);
                }
            }
        }
    }

    /// Point-in-time copy, sorted newest first and truncated to the limit
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.events.iter().cloned().collect();
        events.sort_by(Event::feed_order);
        events.truncate(self.limit);
        events
    }

    /// Oldest held event, if any
    pub fn oldest(&self) -> Option<&Event> {
        self.events.iter().min_by(|a, b| Event::feed_order(b, a))
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.seen.contains(id)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kind, PublicKey, Signature, Timestamp, UnsignedEvent};
    use proptest::prelude::*;

    fn event(created_at: u64, id: u8) -> Event {
        UnsignedEvent::new(PublicKey::from_bytes([1; 32]), Timestamp(created_at), Kind::TEXT_NOTE, "")
            .into_event(EventId::from_bytes([id; 32]), Signature::from_bytes([0; 64]))
    }

    #[test]
    fn test_cap_keeps_most_recent() {
        let mut buffer = FeedBuffer::new(3);
        for i in 1..=5u8 {
            assert!(buffer.insert(event(i as u64 * 10, i)));
        }

        let snapshot = buffer.snapshot();
        let times: Vec<u64> = snapshot.iter().map(|e| e.created_at.0).collect();
        assert_eq!(times, vec![50, 40, 30]);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut buffer = FeedBuffer::new(10);
        assert!(buffer.insert(event(1, 1)));
        assert!(!buffer.insert(event(1, 1)));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_older_than_window_rejected_when_full() {
        let mut buffer = FeedBuffer::new(2);
        buffer.insert(event(20, 2));
        buffer.insert(event(30, 3));
        assert!(!buffer.insert(event(10, 1)));
        assert!(!buffer.contains(&EventId::from_bytes([1; 32])));
        assert_eq!(buffer.oldest().map(|e| e.created_at.0), Some(20));
    }

    #[test]
    fn test_shrinking_limit_truncates() {
        let mut buffer = FeedBuffer::new(5);
        for i in 1..=5u8 {
            buffer.insert(event(i as u64, i));
        }
        buffer.set_limit(2);
        let times: Vec<u64> = buffer.snapshot().iter().map(|e| e.created_at.0).collect();
        assert_eq!(times, vec![5, 4]);
    }

    proptest! {
        #[test]
        fn prop_buffer_never_exceeds_limit_and_is_sorted(
            limit in 1usize..8,
            times in proptest::collection::vec(0u64..50, 0..40),
        ) {
            let mut buffer = FeedBuffer::new(limit);
            for (i, t) in times.iter().enumerate() {
                buffer.insert(event(*t, i as u8));
                prop_assert!(buffer.len() <= limit);
            }

            let snapshot = buffer.snapshot();
            for pair in snapshot.windows(2) {
                prop_assert!(Event::feed_order(&pair[0], &pair[1]) != std::cmp::Ordering::Greater);
            }

            let mut all: Vec<u64> = times.clone();
            all.sort_unstable_by(|a, b| b.cmp(a));
            all.truncate(limit);
            let held: Vec<u64> = snapshot.iter().map(|e| e.created_at.0).collect();
            prop_assert_eq!(held, all);
        }
    }
}
