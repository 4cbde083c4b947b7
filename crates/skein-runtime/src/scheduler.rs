//! Admission scheduler
//!
//! Decides when a queued request may run against the execution backend.
//! - Queue ordered by priority, then by enqueue order
//! - At most `max_concurrent` requests admitted at once
//! - Admissions happen in bursts at least `pacing` apart
//!
//! The scheduler never touches the backend or a clock itself: the caller
//! passes `now` and acts on the returned [`Admission`].

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use skein_core::{Priority, RequestId};

#[derive(Clone, Debug)]
struct Queued {
    request_id: RequestId,
    priority: Priority,
    seq: u64,
}

/// Outcome of one [`Scheduler::process`] call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Admission {
    /// Requests to hand to the backend now, in priority order
    pub admitted: Vec<RequestId>,
    /// When `process` should be called again, if requests are still waiting
    pub wake_at: Option<Instant>,
}

/// Bounded-concurrency priority queue with burst pacing
#[derive(Debug)]
pub struct Scheduler {
    queue: Vec<Queued>,
    active: HashSet<RequestId>,
    max_concurrent: usize,
    pacing: Duration,
    next_burst_at: Option<Instant>,
    seq: u64,
}

impl Scheduler {
    pub fn new(max_concurrent: usize, pacing: Duration) -> Self {
        Scheduler {
            queue: Vec::new(),
            active: HashSet::new(),
            max_concurrent,
            pacing,
            next_burst_at: None,
            seq: 0,
        }
    }

    /// Queue a request. Equal priorities keep enqueue order.
    pub fn enqueue(&mut self, request_id: RequestId, priority: Priority) {
        self.seq += 1;
        self.queue.push(Queued {
            request_id,
            priority,
            seq: self.seq,
        });
        self.sort();
    }

    /// Strengthen the priority of a queued request.
    ///
    /// Returns true if the queue changed. Admitted requests and weaker
    /// priorities are left alone.
    pub fn escalate(&mut self, request_id: RequestId, priority: Priority) -> bool {
        let Some(entry) = self.queue.iter_mut().find(|q| q.request_id == request_id) else {
            return false;
        };
        if !priority.outranks(entry.priority) {
            return false;
        }
        debug!(request = %request_id, from = ?entry.priority, to = ?priority, "escalating queued request");
        entry.priority = priority;
        self.sort();
        true
    }

    /// Drop a request that is still waiting
    pub fn remove(&mut self, request_id: RequestId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|q| q.request_id != request_id);
        self.queue.len() != before
    }

    /// Free the slot of an admitted request. Releasing twice is a no-op.
    pub fn release(&mut self, request_id: RequestId) -> bool {
        self.active.remove(&request_id)
    }

    /// Admit as many queued requests as free slots allow.
    ///
    /// An empty queue, a full ceiling, or a call inside the pacing window
    /// admits nothing.
    pub fn process(&mut self, now: Instant) -> Admission {
        if self.queue.is_empty() {
            return Admission::default();
        }

        if let Some(at) = self.next_burst_at {
            if now < at {
                return Admission {
                    admitted: Vec::new(),
                    wake_at: Some(at),
                };
            }
        }

        let free = self.max_concurrent.saturating_sub(self.active.len());
        if free == 0 {
            // Woken again by a release
            return Admission::default();
        }

        let take = free.min(self.queue.len());
        let admitted: Vec<RequestId> = self.queue.drain(..take).map(|q| q.request_id).collect();
        self.active.extend(admitted.iter().copied());

        let next = now + self.pacing;
        self.next_burst_at = Some(next);

        debug!(
            admitted = admitted.len(),
            active = self.active.len(),
            queued = self.queue.len(),
            "admission burst"
        );

        Admission {
            admitted,
            wake_at: if self.queue.is_empty() { None } else { Some(next) },
        }
    }

    pub fn is_active(&self, request_id: RequestId) -> bool {
        self.active.contains(&request_id)
    }

    pub fn is_queued(&self, request_id: RequestId) -> bool {
        self.queue.iter().any(|q| q.request_id == request_id)
    }

    /// Priority of a waiting request
    pub fn queued_priority(&self, request_id: RequestId) -> Option<Priority> {
        self.queue
            .iter()
            .find(|q| q.request_id == request_id)
            .map(|q| q.priority)
    }

    /// Waiting requests in admission order
    pub fn queued(&self) -> Vec<RequestId> {
        self.queue.iter().map(|q| q.request_id).collect()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn sort(&mut self) {
        self.queue.sort_by_key(|q| (q.priority, q.seq));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> RequestId {
        RequestId::new(n)
    }

    fn pacing() -> Duration {
        Duration::from_millis(250)
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let mut s = Scheduler::new(10, pacing());
        s.enqueue(id(1), Priority::Low);
        s.enqueue(id(2), Priority::Medium);
        s.enqueue(id(3), Priority::High);
        s.enqueue(id(4), Priority::Medium);

        assert_eq!(s.queued(), vec![id(3), id(2), id(4), id(1)]);
    }

    #[test]
    fn test_ceiling_and_release() {
        let mut s = Scheduler::new(10, pacing());
        for n in 1..=15 {
            s.enqueue(id(n), Priority::Medium);
        }

        let t0 = Instant::now();
        let first = s.process(t0);
        assert_eq!(first.admitted.len(), 10);
        assert_eq!(first.wake_at, Some(t0 + pacing()));
        assert_eq!(s.active_len(), 10);
        assert_eq!(s.queued_len(), 5);

        // Full: nothing moves even after the pacing window
        assert!(s.process(t0 + pacing()).admitted.is_empty());

        assert!(s.release(id(1)));
        assert!(!s.release(id(1)));
        let next = s.process(t0 + pacing());
        assert_eq!(next.admitted, vec![id(11)]);
        assert_eq!(s.active_len(), 10);
        assert_eq!(s.queued_len(), 4);
    }

    #[test]
    fn test_pacing_window_defers() {
        let mut s = Scheduler::new(10, pacing());
        let t0 = Instant::now();
        s.enqueue(id(1), Priority::Medium);
        assert_eq!(s.process(t0).admitted, vec![id(1)]);

        s.enqueue(id(2), Priority::Medium);
        let deferred = s.process(t0 + Duration::from_millis(100));
        assert!(deferred.admitted.is_empty());
        assert_eq!(deferred.wake_at, Some(t0 + pacing()));

        assert_eq!(s.process(t0 + pacing()).admitted, vec![id(2)]);
    }

    #[test]
    fn test_escalate_resorts_queue_only() {
        let mut s = Scheduler::new(1, pacing());
        s.enqueue(id(1), Priority::Low);
        s.enqueue(id(2), Priority::Low);
        s.enqueue(id(3), Priority::Medium);

        let t0 = Instant::now();
        assert_eq!(s.process(t0).admitted, vec![id(3)]);

        assert!(s.escalate(id(2), Priority::High));
        assert_eq!(s.queued(), vec![id(2), id(1)]);
        assert_eq!(s.queued_priority(id(2)), Some(Priority::High));

        // Never downgraded
        assert!(!s.escalate(id(2), Priority::Low));
        assert_eq!(s.queued_priority(id(2)), Some(Priority::High));

        // Admitted requests are not re-prioritised
        assert!(!s.escalate(id(3), Priority::High));
        assert!(s.is_active(id(3)));
    }

    #[test]
    fn test_remove_and_empty_queue_noop() {
        let mut s = Scheduler::new(2, pacing());
        assert_eq!(s.process(Instant::now()), Admission::default());

        s.enqueue(id(1), Priority::Medium);
        assert!(s.remove(id(1)));
        assert!(!s.remove(id(1)));
        assert_eq!(s.process(Instant::now()), Admission::default());
    }
}
