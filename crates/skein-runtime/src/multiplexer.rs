//! Multiplexer - the orchestration state machine
//!
//! Owns the registry, scheduler, feed registry, metadata batcher and a timer
//! wheel. It is driven from a single control task:
//! - public operations (`subscribe`, `register_feed`, ...)
//! - backend replies (`handle_reply`)
//! - timers (`fire_due`, woken at `next_deadline`)
//!
//! Every method takes the current instant, so the whole machine can be
//! exercised synchronously in tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use skein_backend::{BackendCommand, BackendReply, ExecutionBackend};
use skein_core::{
    check_request, normalize_relays, CanonicalKey, Event, Filter, ListenerId, Priority, RelayUrl, RequestId,
};

use crate::registry::run_guarded;
use crate::{
    BatchId, CompleteCallback, EventCallback, FeedRegistry, FeedRequest, FeedSlot, Joined,
    ListenerIds, MetadataBatcher, MetadataCategory, Route, Scheduler, SkeinConfig, Sink,
    SubscriptionRegistry, SubscriptionState, Teardown,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Sharing {
    Shared,
    /// One-shot collectors get their own request
    Exclusive,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Timer {
    ProcessQueue,
    FlushMetadata,
    CloseBatch(BatchId),
    SnapshotTimeout {
        feed: CanonicalKey,
        resolver: ListenerId,
    },
}

/// Counters for observability and tests
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    pub subscribe_calls: u64,
    /// Malformed requests answered without a network call
    pub rejected_requests: u64,
    pub requests_created: u64,
    /// Callers attached to an existing shared subscription
    pub shared_joins: u64,
    pub escalations: u64,
    pub requests_dispatched: u64,
    pub teardowns: u64,
    pub events_received: u64,
    pub backend_errors: u64,
    pub metadata_flushes: u64,
    pub snapshots_requested: u64,
}

/// Orchestration state of one service instance
pub struct Multiplexer {
    config: SkeinConfig,
    backend: Arc<dyn ExecutionBackend>,
    ids: ListenerIds,
    registry: SubscriptionRegistry,
    scheduler: Scheduler,
    feeds: FeedRegistry,
    batcher: MetadataBatcher,
    timers: BTreeMap<(Instant, u64), Timer>,
    timer_seq: u64,
    query_seq: u64,
    queue_wake: Option<Instant>,
    stats: MultiplexerStats,
}

impl Multiplexer {
    pub fn new(config: SkeinConfig, backend: Arc<dyn ExecutionBackend>, ids: ListenerIds) -> Self {
        Multiplexer {
            scheduler: Scheduler::new(config.max_concurrent, config.pacing),
            registry: SubscriptionRegistry::new(),
            feeds: FeedRegistry::new(),
            batcher: MetadataBatcher::new(),
            timers: BTreeMap::new(),
            timer_seq: 0,
            query_seq: 0,
            queue_wake: None,
            stats: MultiplexerStats::default(),
            config,
            backend,
            ids,
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Attach a listener to the shared subscription for `(filters, relays)`.
    ///
    /// Returns the underlying request, or `None` for a malformed request
    /// (no filters, or no relays after normalization); `on_complete` then
    /// fires immediately and nothing touches the network.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &mut self,
        listener: ListenerId,
        filters: Vec<Filter>,
        relays: Option<Vec<RelayUrl>>,
        priority: Priority,
        on_event: EventCallback,
        on_complete: Option<CompleteCallback>,
        now: Instant,
    ) -> Option<RequestId> {
        self.attach(Sharing::Shared, listener, filters, relays, priority, on_event, on_complete, now)
    }

    /// Like [`Multiplexer::subscribe`], but the request is never shared, so
    /// the listener sees the whole backlog even when an identical
    /// subscription is already running.
    #[allow(clippy::too_many_arguments)]
    pub fn query(
        &mut self,
        listener: ListenerId,
        filters: Vec<Filter>,
        relays: Option<Vec<RelayUrl>>,
        priority: Priority,
        on_event: EventCallback,
        on_complete: Option<CompleteCallback>,
        now: Instant,
    ) -> Option<RequestId> {
        self.attach(Sharing::Exclusive, listener, filters, relays, priority, on_event, on_complete, now)
    }

    #[allow(clippy::too_many_arguments)]
    fn attach(
        &mut self,
        sharing: Sharing,
        listener: ListenerId,
        filters: Vec<Filter>,
        relays: Option<Vec<RelayUrl>>,
        priority: Priority,
        on_event: EventCallback,
        on_complete: Option<CompleteCallback>,
        now: Instant,
    ) -> Option<RequestId> {
        self.stats.subscribe_calls += 1;
        let relays = relays.as_deref().unwrap_or(self.config.default_relays.as_slice());

        let (key, relays) = match CanonicalKey::for_request(&filters, relays, self.config.max_relays_per_request) {
            Ok(request) => request,
            Err(e) => {
                debug!(%listener, "malformed request ignored: {}", e);
                self.stats.rejected_requests += 1;
                if let Some(done) = on_complete {
                    run_guarded("rejected request", done);
                }
                return None;
            }
        };
        let key = match sharing {
            Sharing::Shared => key,
            Sharing::Exclusive => {
                self.query_seq += 1;
                CanonicalKey::unique("query", self.query_seq, &filters, &relays)
            }
        };

        let joined = self.registry.subscribe(
            key,
            filters,
            relays,
            priority,
            listener,
            Sink::Callback { on_event, on_complete },
        );
        Some(self.admit(joined, priority, now))
    }

    /// Detach a subscription listener; the last one out tears down
    pub fn unsubscribe(&mut self, listener: ListenerId, now: Instant) {
        if let Some(teardown) = self.registry.unsubscribe(listener) {
            self.teardown(teardown, now);
        }
    }

    fn admit(&mut self, joined: Joined, priority: Priority, now: Instant) -> RequestId {
        match joined {
            Joined::Created(request_id) => {
                self.stats.requests_created += 1;
                self.scheduler.enqueue(request_id, priority);
                self.schedule_process(now);
                request_id
            }
            Joined::Attached {
                request_id, escalated, ..
            } => {
                self.stats.shared_joins += 1;
                if escalated {
                    self.stats.escalations += 1;
                    // Queue-only: an admitted request keeps running as is
                    self.scheduler.escalate(request_id, priority);
                }
                request_id
            }
        }
    }

    fn teardown(&mut self, teardown: Teardown, now: Instant) {
        self.stats.teardowns += 1;
        let request_id = teardown.request_id;
        match teardown.state {
            SubscriptionState::Queued => {
                self.scheduler.remove(request_id);
            }
            SubscriptionState::Dispatched => {
                if !teardown.terminated {
                    self.backend.dispatch(BackendCommand::Close { request_id });
                }
                if self.scheduler.release(request_id) {
                    self.schedule_process(now);
                }
            }
        }
    }

    fn resolve_relays(&self, relays: Option<&[RelayUrl]>) -> Vec<RelayUrl> {
        let relays = relays.unwrap_or(self.config.default_relays.as_slice());
        normalize_relays(relays, self.config.max_relays_per_request)
    }

    // ------------------------------------------------------------------
    // Feeds
    // ------------------------------------------------------------------

    /// Add a live listener to a feed, opening the feed if needed
    pub fn register_feed(
        &mut self,
        listener: ListenerId,
        feed: FeedRequest,
        on_event: EventCallback,
        now: Instant,
    ) -> Option<CanonicalKey> {
        let key = self.open_feed(feed, now)?;
        self.feeds.add_listener(&key, listener, on_event);
        Some(key)
    }

    /// Remove a feed listener or an unanswered snapshot request
    pub fn unregister_feed(&mut self, listener: ListenerId, now: Instant) {
        if let Some(subscription) = self.feeds.remove(listener) {
            self.unsubscribe(subscription, now);
        }
    }

    /// Ask for a feed's buffer. Answered when the feed's subscription
    /// completes, at once if it already has, or with whatever is buffered
    /// when the snapshot timeout fires.
    pub fn request_snapshot(
        &mut self,
        resolver: ListenerId,
        feed: FeedRequest,
        reply: oneshot::Sender<Vec<Event>>,
        now: Instant,
    ) {
        self.stats.snapshots_requested += 1;
        let Some(key) = self.open_feed(feed, now) else {
            let _ = reply.send(Vec::new());
            return;
        };
        if let Some(resolver) = self.feeds.add_resolver(&key, resolver, reply) {
            let at = now + self.config.snapshot_timeout;
            self.schedule(at, Timer::SnapshotTimeout { feed: key, resolver });
        }
    }

    fn open_feed(&mut self, feed: FeedRequest, now: Instant) -> Option<CanonicalKey> {
        let relays = self.resolve_relays(feed.relays.as_deref());
        if let Err(e) = check_request(&feed.filters, &relays) {
            debug!(limit = feed.limit, "malformed feed ignored: {}", e);
            self.stats.rejected_requests += 1;
            return None;
        }
        if feed.limit == 0 {
            debug!("feed with zero limit ignored");
            self.stats.rejected_requests += 1;
            return None;
        }

        let key = feed.key(&relays);
        match self.feeds.ensure(&key, feed.filters.clone(), relays.clone(), feed.limit, &self.ids) {
            FeedSlot::Created(subscription) => {
                self.open_feed_subscription(&key, feed.filters, relays, subscription, now);
            }
            FeedSlot::Requeried { previous, subscription } => {
                // The old query goes first so the feed key is free again
                self.unsubscribe(previous, now);
                self.open_feed_subscription(&key, feed.filters, relays, subscription, now);
            }
            FeedSlot::Existing => {}
        }
        Some(key)
    }

    fn open_feed_subscription(
        &mut self,
        key: &CanonicalKey,
        filters: Vec<Filter>,
        relays: Vec<RelayUrl>,
        subscription: ListenerId,
        now: Instant,
    ) {
        // The feed key doubles as the subscription key, so a feed never
        // shares its live subscription with unrelated callers.
        let joined = self.registry.subscribe(
            key.clone(),
            filters,
            relays,
            Priority::Medium,
            subscription,
            Sink::Route(Route::Feed(key.clone())),
        );
        self.admit(joined, Priority::Medium, now);
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Queue a by-id metadata lookup for the current window
    pub fn request_metadata(
        &mut self,
        listener: ListenerId,
        category: MetadataCategory,
        id: &str,
        on_result: EventCallback,
        now: Instant,
    ) {
        if self.batcher.request(category, id, listener, on_result) {
            self.schedule(now + self.config.metadata_window, Timer::FlushMetadata);
        }
    }

    pub fn cancel_metadata(&mut self, listener: ListenerId) {
        self.batcher.remove(listener);
    }

    fn flush_metadata(&mut self, now: Instant) {
        let Some(flush) = self.batcher.flush() else {
            return;
        };
        self.stats.metadata_flushes += 1;

        let relays = self.resolve_relays(None);
        if relays.is_empty() {
            warn!(batch = flush.batch, "no relays configured, metadata batch dropped");
            return;
        }

        let key = CanonicalKey::unique("metadata", flush.batch, &flush.filters, &relays);
        let subscription = self.ids.next();
        let joined = self.registry.subscribe(
            key,
            flush.filters,
            relays,
            Priority::Low,
            subscription,
            Sink::Route(Route::Batch(flush.batch)),
        );
        self.batcher.open_batch(flush.batch, subscription);
        self.admit(joined, Priority::Low, now);

        // Closed after a fixed lifetime whether or not it completes
        let at = now + self.config.metadata_batch_lifetime;
        self.schedule(at, Timer::CloseBatch(flush.batch));
    }

    // ------------------------------------------------------------------
    // Backend replies
    // ------------------------------------------------------------------

    pub fn handle_reply(&mut self, reply: BackendReply, now: Instant) {
        match reply {
            BackendReply::Event { request_id, event } => {
                self.stats.events_received += 1;
                for route in self.registry.deliver(request_id, &event) {
                    match route {
                        Route::Feed(key) => {
                            self.feeds.on_event(&key, &event);
                        }
                        Route::Batch(_) => {
                            self.batcher.route(&event);
                        }
                    }
                }
            }
            BackendReply::Eose { request_id } => {
                debug!(request = %request_id, "backlog exhausted");
                if self.scheduler.release(request_id) {
                    self.schedule_process(now);
                }
                let routes = self.registry.complete(request_id);
                self.route_completion(routes, now);
            }
            BackendReply::Closed { request_id } => {
                debug!(request = %request_id, "request closed");
                self.finish(request_id, now);
            }
            BackendReply::Error {
                request_id: Some(request_id),
                message,
            } => {
                self.stats.backend_errors += 1;
                warn!(request = %request_id, "request failed: {}", message);
                self.finish(request_id, now);
            }
            BackendReply::Error {
                request_id: None,
                message,
            } => {
                self.stats.backend_errors += 1;
                warn!("backend error: {}", message);
            }
        }
    }

    fn finish(&mut self, request_id: RequestId, now: Instant) {
        if self.scheduler.release(request_id) {
            self.schedule_process(now);
        }
        let routes = self.registry.terminate(request_id);
        self.route_completion(routes, now);
    }

    fn route_completion(&mut self, routes: Vec<Route>, now: Instant) {
        for route in routes {
            if let Route::Feed(key) = route {
                if let Some(subscription) = self.feeds.on_complete(&key) {
                    self.unsubscribe(subscription, now);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Admission and timers
    // ------------------------------------------------------------------

    fn run_scheduler(&mut self, now: Instant) {
        let admission = self.scheduler.process(now);
        for request_id in admission.admitted {
            self.dispatch(request_id);
        }
        if let Some(at) = admission.wake_at {
            self.schedule_process(at);
        }
    }

    fn dispatch(&mut self, request_id: RequestId) {
        let Some(sub) = self.registry.mark_dispatched(request_id) else {
            self.scheduler.release(request_id);
            return;
        };
        debug!(request = %request_id, priority = ?sub.priority, relays = sub.relays.len(), "dispatching request");
        let command = BackendCommand::Subscribe {
            request_id,
            filters: sub.filters.clone(),
            relays: sub.relays.clone(),
            cancel: sub.cancel.clone(),
        };
        self.stats.requests_dispatched += 1;
        self.backend.dispatch(command);
    }

    fn schedule_process(&mut self, at: Instant) {
        if matches!(self.queue_wake, Some(pending) if pending <= at) {
            return;
        }
        self.queue_wake = Some(at);
        self.schedule(at, Timer::ProcessQueue);
    }

    fn schedule(&mut self, at: Instant, timer: Timer) {
        self.timer_seq += 1;
        self.timers.insert((at, self.timer_seq), timer);
    }

    /// Earliest armed timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(at, _)| *at)
    }

    /// Run every timer due at `now`. Returns how many fired.
    pub fn fire_due(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some((&(at, _), _)) = self.timers.first_key_value() {
            if at > now {
                break;
            }
            let Some((_, timer)) = self.timers.pop_first() else {
                break;
            };
            fired += 1;
            self.on_timer(timer, now);
        }
        fired
    }

    fn on_timer(&mut self, timer: Timer, now: Instant) {
        match timer {
            Timer::ProcessQueue => {
                self.queue_wake = None;
                self.run_scheduler(now);
            }
            Timer::FlushMetadata => self.flush_metadata(now),
            Timer::CloseBatch(batch) => {
                if let Some(subscription) = self.batcher.close_batch(batch) {
                    debug!(batch, "metadata batch lifetime over");
                    self.unsubscribe(subscription, now);
                }
            }
            Timer::SnapshotTimeout { feed, resolver } => {
                if let Some(subscription) = self.feeds.resolve(&feed, resolver) {
                    self.unsubscribe(subscription, now);
                }
            }
        }
    }

    /// Tear everything down: pending snapshots get their current buffer,
    /// running requests are closed.
    pub fn shutdown(&mut self) {
        self.batcher.drain();
        self.feeds.drain();
        for teardown in self.registry.drain() {
            if teardown.state == SubscriptionState::Dispatched && !teardown.terminated {
                self.backend.dispatch(BackendCommand::Close {
                    request_id: teardown.request_id,
                });
            }
        }
        self.timers.clear();
        self.queue_wake = None;
        info!(stats = ?self.stats, "multiplexer shut down");
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn stats(&self) -> &MultiplexerStats {
        &self.stats
    }

    pub fn config(&self) -> &SkeinConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn feeds(&self) -> &FeedRegistry {
        &self.feeds
    }

    pub fn batcher(&self) -> &MetadataBatcher {
        &self.batcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use skein_backend::RecordingBackend;
    use skein_core::{Kind, PublicKey, Signature, Timestamp, UnsignedEvent};
    use std::time::Duration;

    struct Harness {
        mux: Multiplexer,
        backend: RecordingBackend,
        ids: ListenerIds,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(test_config())
        }

        fn with_config(config: SkeinConfig) -> Self {
            let backend = RecordingBackend::new();
            let ids = ListenerIds::default();
            Harness {
                mux: Multiplexer::new(config, Arc::new(backend.clone()), ids.clone()),
                backend,
                ids,
                now: Instant::now(),
            }
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            self.mux.fire_due(self.now);
        }

        fn tick(&mut self) {
            self.mux.fire_due(self.now);
        }

        fn subscribe(&mut self, filters: Vec<Filter>, relays: Vec<RelayUrl>, priority: Priority) -> (ListenerId, Option<RequestId>) {
            let listener = self.ids.next();
            let request = self.mux.subscribe(
                listener,
                filters,
                Some(relays),
                priority,
                Arc::new(|_: &Event| {}),
                None,
                self.now,
            );
            (listener, request)
        }

        fn reply(&mut self, reply: BackendReply) {
            self.mux.handle_reply(reply, self.now);
        }
    }

    fn test_config() -> SkeinConfig {
        SkeinConfig {
            default_relays: vec![relay("default")],
            ..SkeinConfig::default()
        }
    }

    fn relay(name: &str) -> RelayUrl {
        RelayUrl::parse(&format!("wss://{}.test", name)).unwrap()
    }

    fn notes(n: u16) -> Vec<Filter> {
        vec![Filter::new().kind(Kind(n))]
    }

    fn note(created_at: u64) -> Event {
        let unsigned = UnsignedEvent::new(PublicKey::from_bytes([3; 32]), Timestamp(created_at), Kind::TEXT_NOTE, "n");
        let id = unsigned.id();
        unsigned.into_event(id, Signature::from_bytes([0; 64]))
    }

    #[test]
    fn test_identical_requests_share_one_backend_call() {
        let mut h = Harness::new();
        let (_, a) = h.subscribe(
            vec![Filter::new().kind(Kind::TEXT_NOTE).limit(20)],
            vec![relay("b"), relay("a")],
            Priority::Medium,
        );
        let (_, b) = h.subscribe(
            vec![Filter::new().limit(20).kind(Kind::TEXT_NOTE)],
            vec![relay("a"), relay("b"), relay("a")],
            Priority::Medium,
        );
        h.tick();

        assert_eq!(a, b);
        assert_eq!(h.backend.subscribe_count(), 1);
        assert_eq!(h.mux.stats().shared_joins, 1);
    }

    #[test]
    fn test_ref_counted_teardown() {
        let mut h = Harness::new();
        let (first, request) = h.subscribe(notes(1), vec![relay("a")], Priority::Medium);
        let (second, _) = h.subscribe(notes(1), vec![relay("a")], Priority::Medium);
        h.tick();

        h.mux.unsubscribe(first, h.now);
        assert!(h.backend.closed().is_empty());

        h.mux.unsubscribe(second, h.now);
        h.mux.unsubscribe(second, h.now);
        assert_eq!(h.backend.closed(), vec![request.unwrap()]);
        assert_eq!(h.mux.stats().teardowns, 1);
        assert_eq!(h.mux.scheduler().active_len(), 0);
    }

    #[test]
    fn test_teardown_while_queued_never_reaches_backend() {
        let mut h = Harness::new();
        let (listener, _) = h.subscribe(notes(1), vec![relay("a")], Priority::Medium);
        h.mux.unsubscribe(listener, h.now);
        h.tick();

        assert_eq!(h.backend.subscribe_count(), 0);
        assert_eq!(h.mux.scheduler().queued_len(), 0);
    }

    #[test]
    fn test_escalation_reorders_queue_never_downgrades() {
        let mut h = Harness::with_config(SkeinConfig {
            max_concurrent: 1,
            ..test_config()
        });
        h.subscribe(notes(1), vec![relay("a")], Priority::Medium);
        h.tick();

        let (_, low) = h.subscribe(notes(2), vec![relay("a")], Priority::Low);
        let (_, queued) = h.subscribe(notes(3), vec![relay("a")], Priority::Medium);
        let queued = queued.unwrap();

        h.subscribe(notes(3), vec![relay("a")], Priority::High);
        assert_eq!(h.mux.scheduler().queued_priority(queued), Some(Priority::High));
        assert_eq!(h.mux.scheduler().queued(), vec![queued, low.unwrap()]);

        h.subscribe(notes(3), vec![relay("a")], Priority::Medium);
        assert_eq!(h.mux.scheduler().queued_priority(queued), Some(Priority::High));
        assert_eq!(h.mux.registry().get(queued).unwrap().priority, Priority::High);
    }

    #[test]
    fn test_concurrency_ceiling() {
        let mut h = Harness::new();
        let mut requests = Vec::new();
        for n in 0..15 {
            let (_, request) = h.subscribe(notes(100 + n), vec![relay("a")], Priority::Medium);
            requests.push(request.unwrap());
        }
        h.tick();

        assert_eq!(h.backend.open_count(), 10);
        assert_eq!(h.mux.scheduler().active_len(), 10);
        assert_eq!(h.mux.scheduler().queued_len(), 5);

        // Nothing moves until a slot frees
        h.advance(Duration::from_secs(1));
        assert_eq!(h.backend.subscribe_count(), 10);

        h.reply(BackendReply::Eose { request_id: requests[0] });
        h.tick();
        assert_eq!(h.backend.subscribe_count(), 11);
        assert_eq!(h.mux.scheduler().queued_len(), 4);
    }

    #[test]
    fn test_freed_slots_wait_for_pacing_window() {
        let mut h = Harness::with_config(SkeinConfig {
            max_concurrent: 1,
            ..test_config()
        });
        let (_, first) = h.subscribe(notes(1), vec![relay("a")], Priority::Medium);
        h.subscribe(notes(2), vec![relay("a")], Priority::Medium);
        h.tick();
        assert_eq!(h.backend.subscribe_count(), 1);

        h.reply(BackendReply::Error {
            request_id: first,
            message: "boom".into(),
        });
        h.tick();
        assert_eq!(h.backend.subscribe_count(), 1);

        h.advance(Duration::from_millis(250));
        assert_eq!(h.backend.subscribe_count(), 2);
    }

    #[test]
    fn test_malformed_request_completes_without_network() {
        let mut h = Harness::new();
        let done = Arc::new(Mutex::new(0));
        let counter = done.clone();
        let listener = h.ids.next();
        let request = h.mux.subscribe(
            listener,
            Vec::new(),
            None,
            Priority::High,
            Arc::new(|_: &Event| {}),
            Some(Box::new(move || *counter.lock() += 1)),
            h.now,
        );
        h.tick();

        assert_eq!(request, None);
        assert_eq!(*done.lock(), 1);
        assert_eq!(h.backend.subscribe_count(), 0);

        let (_, request) = h.subscribe(notes(1), Vec::new(), Priority::High);
        assert_eq!(request, None);
        assert_eq!(h.mux.stats().rejected_requests, 2);
    }

    #[test]
    fn test_events_fan_out_once_per_listener() {
        let mut h = Harness::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let mut request = None;
        for _ in 0..2 {
            let seen = hits.clone();
            let listener = h.ids.next();
            request = h.mux.subscribe(
                listener,
                notes(1),
                Some(vec![relay("a")]),
                Priority::Medium,
                Arc::new(move |e: &Event| seen.lock().push(e.id)),
                None,
                h.now,
            );
        }
        h.tick();
        let request_id = request.unwrap();

        let event = note(5);
        h.reply(BackendReply::Event { request_id, event: event.clone() });
        h.reply(BackendReply::Event { request_id, event });
        assert_eq!(hits.lock().len(), 2);
    }

    #[test]
    fn test_feed_snapshot_capped_and_sorted() {
        let mut h = Harness::new();
        let feed = FeedRequest::new(notes(1), 3).relays(vec![relay("a")]);
        let listener = h.ids.next();
        h.mux.register_feed(listener, feed.clone(), Arc::new(|_: &Event| {}), h.now);
        h.tick();
        let (request_id, _, _) = h.backend.last_subscription().unwrap();

        for t in 1..=5 {
            h.reply(BackendReply::Event { request_id, event: note(t) });
        }

        let (tx, mut rx) = oneshot::channel();
        let resolver = h.ids.next();
        h.mux.request_snapshot(resolver, feed, tx, h.now);
        h.reply(BackendReply::Eose { request_id });

        let times: Vec<u64> = rx.try_recv().unwrap().iter().map(|e| e.created_at.0).collect();
        assert_eq!(times, vec![5, 4, 3]);
        // Same feed, no second subscription
        assert_eq!(h.backend.subscribe_count(), 1);
    }

    #[test]
    fn test_snapshot_times_out_with_partial_buffer() {
        let mut h = Harness::new();
        let feed = FeedRequest::new(notes(1), 10).relays(vec![relay("a")]);
        let (tx, mut rx) = oneshot::channel();
        let resolver = h.ids.next();
        h.mux.request_snapshot(resolver, feed, tx, h.now);
        h.tick();
        let (request_id, _, _) = h.backend.last_subscription().unwrap();
        h.reply(BackendReply::Event { request_id, event: note(1) });

        h.advance(Duration::from_secs(3));
        assert!(rx.try_recv().is_err());

        h.advance(Duration::from_secs(1));
        assert_eq!(rx.try_recv().unwrap().len(), 1);
        // The snapshot was the feed's only consumer
        assert_eq!(h.backend.closed(), vec![request_id]);
        assert!(h.mux.feeds().is_empty());
    }

    #[test]
    fn test_named_feed_resized_in_place() {
        let mut h = Harness::new();
        let small = FeedRequest::new(notes(1), 5).relays(vec![relay("a")]).named("home");
        let large = FeedRequest::new(notes(1), 50).relays(vec![relay("a")]).named("home");

        let first = h.ids.next();
        let key = h.mux.register_feed(first, small, Arc::new(|_: &Event| {}), h.now).unwrap();
        let second = h.ids.next();
        h.mux.register_feed(second, large, Arc::new(|_: &Event| {}), h.now);
        h.tick();

        assert_eq!(h.mux.feeds().get(&key).unwrap().limit(), 50);
        assert_eq!(h.backend.subscribe_count(), 1);

        h.mux.unregister_feed(first, h.now);
        assert!(h.backend.closed().is_empty());
        h.mux.unregister_feed(second, h.now);
        assert_eq!(h.backend.closed().len(), 1);
    }

    #[test]
    fn test_named_feed_requery_replaces_subscription() {
        let mut h = Harness::new();
        let notes_feed = FeedRequest::new(notes(1), 20).relays(vec![relay("a")]).named("home");
        let reactions_feed = FeedRequest::new(notes(7), 20).relays(vec![relay("a")]).named("home");

        let first = h.ids.next();
        let key = h.mux.register_feed(first, notes_feed, Arc::new(|_: &Event| {}), h.now).unwrap();
        h.tick();
        let (old_request, _, _) = h.backend.last_subscription().unwrap();
        h.reply(BackendReply::Event { request_id: old_request, event: note(1) });

        let second = h.ids.next();
        h.mux.register_feed(second, reactions_feed, Arc::new(|_: &Event| {}), h.now);
        assert_eq!(h.backend.closed(), vec![old_request]);

        h.advance(Duration::from_millis(250));
        let (new_request, filters, _) = h.backend.last_subscription().unwrap();
        assert_ne!(new_request, old_request);
        assert_eq!(filters, notes(7));

        let entry = h.mux.feeds().get(&key).unwrap();
        assert_eq!(entry.filters, notes(7));
        assert!(entry.is_empty());
        assert_eq!(entry.listener_count(), 2);
    }

    #[test]
    fn test_query_never_joins_running_subscription() {
        let mut h = Harness::new();
        let (_, shared) = h.subscribe(notes(1), vec![relay("a")], Priority::Medium);
        let listener = h.ids.next();
        let own = h.mux.query(
            listener,
            notes(1),
            Some(vec![relay("a")]),
            Priority::High,
            Arc::new(|_: &Event| {}),
            None,
            h.now,
        );
        h.tick();

        assert_ne!(own, shared);
        assert_eq!(h.backend.subscribe_count(), 2);
        assert_eq!(h.mux.stats().shared_joins, 0);
    }

    #[test]
    fn test_metadata_window_flushes_once() {
        let mut h = Harness::new();
        let p1 = PublicKey::from_bytes([1; 32]).to_hex();
        let p2 = PublicKey::from_bytes([2; 32]).to_hex();

        for id in [&p1, &p2] {
            let listener = h.ids.next();
            h.mux
                .request_metadata(listener, MetadataCategory::Profile, id, Arc::new(|_: &Event| {}), h.now);
        }
        h.advance(Duration::from_millis(1499));
        assert_eq!(h.backend.subscribe_count(), 0);

        h.advance(Duration::from_millis(1));
        let subs = h.backend.subscriptions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].1.len(), 1);
        assert_eq!(subs[0].1[0].authors.as_ref().map(Vec::len), Some(2));
        assert_eq!(subs[0].2, vec![relay("default")]);

        // After the flush a new window starts
        let listener = h.ids.next();
        h.mux
            .request_metadata(listener, MetadataCategory::Profile, &p1, Arc::new(|_: &Event| {}), h.now);
        h.advance(Duration::from_millis(1500));
        assert_eq!(h.backend.subscribe_count(), 2);
    }

    #[test]
    fn test_metadata_batch_closed_after_lifetime() {
        let mut h = Harness::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        let author = PublicKey::from_bytes([8; 32]);
        let listener = h.ids.next();
        h.mux.request_metadata(
            listener,
            MetadataCategory::Profile,
            &author.to_hex(),
            Arc::new(move |_: &Event| *counter.lock() += 1),
            h.now,
        );
        h.advance(Duration::from_millis(1500));
        let (request_id, _, _) = h.backend.last_subscription().unwrap();

        let unsigned = UnsignedEvent::new(author, Timestamp(1), Kind::METADATA, "{}");
        let id = unsigned.id();
        h.reply(BackendReply::Event {
            request_id,
            event: unsigned.into_event(id, Signature::from_bytes([0; 64])),
        });
        assert_eq!(*hits.lock(), 1);

        h.advance(Duration::from_secs(10));
        assert_eq!(h.backend.closed(), vec![request_id]);
        assert_eq!(h.mux.batcher().open_batches(), 0);
    }

    #[test]
    fn test_shutdown_closes_running_requests() {
        let mut h = Harness::new();
        h.subscribe(notes(1), vec![relay("a")], Priority::Medium);
        h.tick();
        h.mux.shutdown();

        assert_eq!(h.backend.closed().len(), 1);
        assert!(h.mux.registry().is_empty());
        assert_eq!(h.mux.next_deadline(), None);
    }
}
