//! Shared subscription registry
//!
//! One entry per canonical key. Every caller that asks for the same key
//! becomes a listener of the same entry; the entry owns one request id and
//! one cancellation token. The last listener to leave tears the entry down,
//! exactly once.
//!
//! Listeners are either user callbacks, invoked here, or internal routes
//! (feed buffers, metadata batches) handed back to the caller to dispatch.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skein_core::{CanonicalKey, Event, Filter, ListenerId, Priority, RelayUrl, RequestId, SeenSet};

/// Callback invoked for each delivered event
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Callback invoked once when a subscription completes
pub type CompleteCallback = Box<dyn FnOnce() + Send>;

/// Identity of one metadata batch
pub type BatchId = u64;

/// Process-wide listener id allocator, shared by handles and the control
/// task so ids can be handed out without a round trip.
#[derive(Clone, Debug)]
pub struct ListenerIds(Arc<AtomicU64>);

impl Default for ListenerIds {
    fn default() -> Self {
        ListenerIds(Arc::new(AtomicU64::new(1)))
    }
}

impl ListenerIds {
    pub fn next(&self) -> ListenerId {
        ListenerId::new(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Internal consumer of a shared subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Feed(CanonicalKey),
    Batch(BatchId),
}

/// Where a listener's events go
pub enum Sink {
    Callback {
        on_event: EventCallback,
        on_complete: Option<CompleteCallback>,
    },
    Route(Route),
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Callback { .. } => f.write_str("Callback"),
            Sink::Route(route) => write!(f, "Route({:?})", route),
        }
    }
}

/// Lifecycle of the underlying request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for admission
    Queued,
    /// Handed to the backend
    Dispatched,
}

/// One deduplicated network subscription
pub struct SharedSubscription {
    pub key: CanonicalKey,
    pub request_id: RequestId,
    pub filters: Vec<Filter>,
    pub relays: Vec<RelayUrl>,
    pub priority: Priority,
    pub state: SubscriptionState,
    /// Backlog exhausted (or the request ended)
    pub completed: bool,
    /// The backend reported closed or error; no more events will come
    pub terminated: bool,
    pub cancel: CancellationToken,
    listeners: Vec<(ListenerId, Sink)>,
    seen: SeenSet,
}

impl SharedSubscription {
    pub fn ref_count(&self) -> usize {
        self.listeners.len()
    }
}

/// Outcome of [`SubscriptionRegistry::subscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Joined {
    /// New entry: its request must be queued for admission
    Created(RequestId),
    /// Attached to a live entry
    Attached {
        request_id: RequestId,
        /// The caller's priority strengthened the entry
        escalated: bool,
        completed: bool,
    },
}

/// The last listener left; the underlying request must be torn down
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Teardown {
    pub request_id: RequestId,
    pub state: SubscriptionState,
    pub terminated: bool,
}

/// Registry of shared subscriptions
#[derive(Default)]
pub struct SubscriptionRegistry {
    subs: HashMap<RequestId, SharedSubscription>,
    by_key: HashMap<CanonicalKey, RequestId>,
    owners: HashMap<ListenerId, RequestId>,
    next_request: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `listener` to the entry for `key`, creating it if needed.
    ///
    /// A callback listener joining an entry that already completed gets its
    /// completion callback immediately.
    pub fn subscribe(
        &mut self,
        key: CanonicalKey,
        filters: Vec<Filter>,
        relays: Vec<RelayUrl>,
        priority: Priority,
        listener: ListenerId,
        sink: Sink,
    ) -> Joined {
        if let Some(&request_id) = self.by_key.get(&key) {
            if let Some(sub) = self.subs.get_mut(&request_id) {
                let escalated = priority.outranks(sub.priority);
                if escalated {
                    debug!(request = %request_id, from = ?sub.priority, to = ?priority, "priority escalated");
                    sub.priority = priority;
                }

                let sink = match sink {
                    Sink::Callback { on_event, on_complete } if sub.completed => {
                        if let Some(done) = on_complete {
                            run_guarded(request_id, done);
                        }
                        Sink::Callback {
                            on_event,
                            on_complete: None,
                        }
                    }
                    other => other,
                };

                sub.listeners.push((listener, sink));
                self.owners.insert(listener, request_id);
                debug!(request = %request_id, refs = sub.ref_count(), "joined shared subscription");

                return Joined::Attached {
                    request_id,
                    escalated,
                    completed: sub.completed,
                };
            }
        }

        self.next_request += 1;
        let request_id = RequestId::new(self.next_request);
        debug!(request = %request_id, key = %key, ?priority, "new shared subscription");

        self.by_key.insert(key.clone(), request_id);
        self.owners.insert(listener, request_id);
        self.subs.insert(
            request_id,
            SharedSubscription {
                key,
                request_id,
                filters,
                relays,
                priority,
                state: SubscriptionState::Queued,
                completed: false,
                terminated: false,
                cancel: CancellationToken::new(),
                listeners: vec![(listener, sink)],
                seen: SeenSet::unbounded(),
            },
        );

        Joined::Created(request_id)
    }

    /// Detach a listener. Returns the teardown when it was the last one.
    pub fn unsubscribe(&mut self, listener: ListenerId) -> Option<Teardown> {
        let request_id = self.owners.remove(&listener)?;
        let sub = self.subs.get_mut(&request_id)?;
        sub.listeners.retain(|(id, _)| *id != listener);

        if !sub.listeners.is_empty() {
            debug!(request = %request_id, refs = sub.ref_count(), "listener left");
            return None;
        }

        let sub = self.subs.remove(&request_id)?;
        if self.by_key.get(&sub.key) == Some(&request_id) {
            self.by_key.remove(&sub.key);
        }
        sub.cancel.cancel();
        debug!(request = %request_id, "last listener left, tearing down");

        Some(Teardown {
            request_id,
            state: sub.state,
            terminated: sub.terminated,
        })
    }

    /// Mark a request as handed to the backend
    pub fn mark_dispatched(&mut self, request_id: RequestId) -> Option<&SharedSubscription> {
        let sub = self.subs.get_mut(&request_id)?;
        sub.state = SubscriptionState::Dispatched;
        Some(sub)
    }

    /// Fan an event out. Callback listeners are invoked here; internal
    /// routes are returned. An id is delivered at most once for the life of
    /// the entry.
    pub fn deliver(&mut self, request_id: RequestId, event: &Event) -> Vec<Route> {
        let Some(sub) = self.subs.get_mut(&request_id) else {
            return Vec::new();
        };
        if !sub.seen.insert(event.id) {
            return Vec::new();
        }

        let mut routes = Vec::new();
        for (_, sink) in &sub.listeners {
            match sink {
                Sink::Callback { on_event, .. } => {
                    let on_event = on_event.clone();
                    run_guarded(request_id, move || on_event(event));
                }
                Sink::Route(route) => routes.push(route.clone()),
            }
        }
        routes
    }

    /// Backlog exhausted: run every completion callback once
    pub fn complete(&mut self, request_id: RequestId) -> Vec<Route> {
        let Some(sub) = self.subs.get_mut(&request_id) else {
            return Vec::new();
        };
        if sub.completed {
            return Vec::new();
        }
        sub.completed = true;
        fire_completions(sub)
    }

    /// The request ended. Completion fires if it had not yet; the entry is
    /// detached from its key so a later request starts fresh.
    pub fn terminate(&mut self, request_id: RequestId) -> Vec<Route> {
        let Some(sub) = self.subs.get_mut(&request_id) else {
            return Vec::new();
        };
        if sub.terminated {
            return Vec::new();
        }
        sub.terminated = true;
        if self.by_key.get(&sub.key) == Some(&request_id) {
            self.by_key.remove(&sub.key);
        }

        if sub.completed {
            return Vec::new();
        }
        sub.completed = true;
        fire_completions(sub)
    }

    pub fn get(&self, request_id: RequestId) -> Option<&SharedSubscription> {
        self.subs.get(&request_id)
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Remove everything, cancelling every request
    pub fn drain(&mut self) -> Vec<Teardown> {
        self.by_key.clear();
        self.owners.clear();
        self.subs
            .drain()
            .map(|(request_id, sub)| {
                sub.cancel.cancel();
                Teardown {
                    request_id,
                    state: sub.state,
                    terminated: sub.terminated,
                }
            })
            .collect()
    }
}

fn fire_completions(sub: &mut SharedSubscription) -> Vec<Route> {
    let request_id = sub.request_id;
    let mut routes = Vec::new();
    for (_, sink) in sub.listeners.iter_mut() {
        match sink {
            Sink::Callback { on_complete, .. } => {
                if let Some(done) = on_complete.take() {
                    run_guarded(request_id, done);
                }
            }
            Sink::Route(route) => routes.push(route.clone()),
        }
    }
    routes
}

/// Run a listener callback; a panic is logged and does not stop delivery
/// to the remaining listeners.
pub(crate) fn run_guarded<F: FnOnce()>(origin: impl fmt::Display, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(origin = %origin, "listener panicked");
    }
}
