//! Skein service
//!
//! [`Skein`] is the cloneable handle UI-layer callers hold. Every operation
//! is turned into a [`Command`] for the control task, which owns the
//! [`Multiplexer`] and is the only place its state is touched.
//!
//! Operations never block: subscriptions and feeds return a handle at once,
//! snapshots and queries are futures that always resolve (possibly empty).

use std::future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use skein_backend::{select_backend, BackendKind, ExecutionBackend, ReplyReceiver, ReplySender};
use skein_core::{
    check_request, normalize_relays, Event, EventId, Filter, ListenerId, Priority, RelayUrl, SkeinError,
    SkeinResult,
};
use skein_transport::RelayPool;

use crate::{
    CompleteCallback, EventCallback, FeedRequest, ListenerIds, MetadataCategory, Multiplexer,
    MultiplexerStats, SkeinConfig,
};

/// Message to the control task
pub enum Command {
    Subscribe {
        listener: ListenerId,
        filters: Vec<Filter>,
        relays: Option<Vec<RelayUrl>>,
        priority: Priority,
        on_event: EventCallback,
        on_complete: Option<CompleteCallback>,
    },
    /// One-shot collector on a request of its own
    Query {
        listener: ListenerId,
        filters: Vec<Filter>,
        relays: Option<Vec<RelayUrl>>,
        on_event: EventCallback,
        on_complete: CompleteCallback,
    },
    Unsubscribe {
        listener: ListenerId,
    },
    RegisterFeed {
        listener: ListenerId,
        feed: FeedRequest,
        on_event: EventCallback,
    },
    UnregisterFeed {
        listener: ListenerId,
    },
    RequestSnapshot {
        resolver: ListenerId,
        feed: FeedRequest,
        reply: oneshot::Sender<Vec<Event>>,
    },
    RequestMetadata {
        listener: ListenerId,
        category: MetadataCategory,
        id: String,
        on_result: EventCallback,
    },
    CancelMetadata {
        listener: ListenerId,
    },
    Stats {
        reply: oneshot::Sender<MultiplexerStats>,
    },
    Shutdown,
}

/// Sends the close command for one listener, at most once
struct Closer {
    commands: Option<mpsc::UnboundedSender<Command>>,
    listener: ListenerId,
    command: fn(ListenerId) -> Command,
    closed: AtomicBool,
}

impl Closer {
    fn new(commands: mpsc::UnboundedSender<Command>, listener: ListenerId, command: fn(ListenerId) -> Command) -> Self {
        Closer {
            commands: Some(commands),
            listener,
            command,
            closed: AtomicBool::new(false),
        }
    }

    fn inert(listener: ListenerId) -> Self {
        Closer {
            commands: None,
            listener,
            command: |listener| Command::Unsubscribe { listener },
            closed: AtomicBool::new(true),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(commands) = &self.commands {
            // A stopped service has nothing left to close
            let _ = commands.send((self.command)(self.listener));
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Closer {
    fn drop(&mut self) {
        self.close();
    }
}

macro_rules! handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name {
            closer: Closer,
        }

        impl $name {
            /// Detach this caller. Closing twice is a no-op; dropping closes.
            pub fn close(&self) {
                self.closer.close();
            }

            pub fn is_closed(&self) -> bool {
                self.closer.is_closed()
            }

            pub fn listener(&self) -> ListenerId {
                self.closer.listener
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("listener", &self.closer.listener)
                    .field("closed", &self.closer.is_closed())
                    .finish()
            }
        }
    };
}

handle!(
    /// Closer of one `subscribe` call
    SubscriptionHandle
);
handle!(
    /// Unregisters one live feed listener
    FeedHandle
);
handle!(
    /// Cancels one metadata lookup
    MetadataHandle
);

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    ids: ListenerIds,
    config: SkeinConfig,
    pool: Arc<dyn RelayPool>,
    backend: BackendKind,
}

/// Handle to a running multiplexer service
#[derive(Clone)]
pub struct Skein {
    inner: Arc<Inner>,
}

impl Skein {
    /// Start the service on the current tokio runtime, executing requests
    /// on a worker thread when `config.offload` is set.
    pub fn start(config: SkeinConfig, pool: Arc<dyn RelayPool>) -> SkeinResult<Self> {
        let executor = config.executor_config();
        let offload = config.offload;
        let backend_pool = pool.clone();
        Self::start_with_backend(config, pool, move |replies| {
            select_backend(backend_pool, replies, executor, offload)
        })
    }

    /// Start the service with a caller-built execution backend
    pub fn start_with_backend<F>(config: SkeinConfig, pool: Arc<dyn RelayPool>, backend: F) -> SkeinResult<Self>
    where
        F: FnOnce(ReplySender) -> Arc<dyn ExecutionBackend>,
    {
        config.validate()?;

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let backend = backend(reply_tx);
        let kind = backend.kind();

        let ids = ListenerIds::default();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::new(config.clone(), backend, ids.clone());
        tokio::spawn(run(mux, command_rx, reply_rx));

        info!(
            backend = ?kind,
            max_concurrent = config.max_concurrent,
            relays = config.default_relays.len(),
            "skein started"
        );

        Ok(Skein {
            inner: Arc::new(Inner {
                commands,
                ids,
                config,
                pool,
                backend: kind,
            }),
        })
    }

    pub fn config(&self) -> &SkeinConfig {
        &self.inner.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend
    }

    /// Listen to a shared subscription
    pub fn subscribe<E>(
        &self,
        filters: Vec<Filter>,
        relays: Option<Vec<RelayUrl>>,
        priority: Priority,
        on_event: E,
    ) -> SubscriptionHandle
    where
        E: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_inner(filters, relays, priority, Arc::new(on_event), None)
    }

    /// Like [`Skein::subscribe`], with a callback fired once the stored
    /// backlog is exhausted or the subscription ends.
    pub fn subscribe_with_completion<E, C>(
        &self,
        filters: Vec<Filter>,
        relays: Option<Vec<RelayUrl>>,
        priority: Priority,
        on_event: E,
        on_complete: C,
    ) -> SubscriptionHandle
    where
        E: Fn(&Event) + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.subscribe_inner(filters, relays, priority, Arc::new(on_event), Some(Box::new(on_complete)))
    }

    fn subscribe_inner(
        &self,
        filters: Vec<Filter>,
        relays: Option<Vec<RelayUrl>>,
        priority: Priority,
        on_event: EventCallback,
        on_complete: Option<CompleteCallback>,
    ) -> SubscriptionHandle {
        let listener = self.inner.ids.next();

        if let Err(e) = check_request(&filters, &self.resolve_relays(relays.as_deref())) {
            debug!(%listener, "malformed subscription, completing at once: {}", e);
            if let Some(done) = on_complete {
                done();
            }
            return SubscriptionHandle {
                closer: Closer::inert(listener),
            };
        }

        let command = Command::Subscribe {
            listener,
            filters,
            relays,
            priority,
            on_event,
            on_complete,
        };
        SubscriptionHandle {
            closer: self.send_with_closer(command, listener, |listener| Command::Unsubscribe { listener }),
        }
    }

    /// Listen to a feed's accepted live items
    pub fn register_feed<E>(&self, feed: FeedRequest, on_event: E) -> FeedHandle
    where
        E: Fn(&Event) + Send + Sync + 'static,
    {
        let listener = self.inner.ids.next();
        let command = Command::RegisterFeed {
            listener,
            feed,
            on_event: Arc::new(on_event),
        };
        FeedHandle {
            closer: self.send_with_closer(command, listener, |listener| Command::UnregisterFeed { listener }),
        }
    }

    /// Point-in-time copy of a feed's buffer, newest first. Resolves when
    /// the feed's backlog is exhausted or the snapshot timeout fires.
    pub async fn request_snapshot(&self, feed: FeedRequest) -> Vec<Event> {
        let (reply, rx) = oneshot::channel();
        let resolver = self.inner.ids.next();
        if !self.send(Command::RequestSnapshot { resolver, feed, reply }) {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Look up metadata by id through the batching window
    pub fn request_metadata<E>(&self, category: MetadataCategory, id: &str, on_result: E) -> MetadataHandle
    where
        E: Fn(&Event) + Send + Sync + 'static,
    {
        let listener = self.inner.ids.next();
        let command = Command::RequestMetadata {
            listener,
            category,
            id: id.to_string(),
            on_result: Arc::new(on_result),
        };
        MetadataHandle {
            closer: self.send_with_closer(command, listener, |listener| Command::CancelMetadata { listener }),
        }
    }

    /// One-shot query: collect until the backlog is exhausted or `timeout`
    /// elapses, then close. Results are in feed order.
    ///
    /// The query runs as a request of its own, so it sees the full backlog
    /// even while an identical subscription is open.
    pub async fn query(&self, filters: Vec<Filter>, relays: Option<Vec<RelayUrl>>, timeout: Duration) -> Vec<Event> {
        let listener = self.inner.ids.next();
        if let Err(e) = check_request(&filters, &self.resolve_relays(relays.as_deref())) {
            debug!(%listener, "malformed query: {}", e);
            return Vec::new();
        }

        let collected = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        let sink = collected.clone();
        let command = Command::Query {
            listener,
            filters,
            relays,
            on_event: Arc::new(move |event: &Event| sink.lock().push(event.clone())),
            on_complete: Box::new(move || {
                let _ = done_tx.send(());
            }),
        };
        let handle = SubscriptionHandle {
            closer: self.send_with_closer(command, listener, |listener| Command::Unsubscribe { listener }),
        };

        if time::timeout(timeout, done_rx).await.is_err() {
            debug!(%listener, "query timed out, returning partial results");
        }
        handle.close();

        let mut events = std::mem::take(&mut *collected.lock());
        events.sort_by(Event::feed_order);
        events
    }

    /// Fetch a single event by id within the lookup timeout
    pub async fn fetch_event(&self, id: EventId, relays: Option<Vec<RelayUrl>>) -> Option<Event> {
        let filter = Filter::new().ids([id]).limit(1);
        self.query(vec![filter], relays, self.inner.config.lookup_timeout)
            .await
            .into_iter()
            .find(|e| e.id == id)
    }

    /// Publish to every relay concurrently. True if at least one accepted.
    pub async fn publish(&self, event: &Event, relays: Option<Vec<RelayUrl>>) -> bool {
        let relays = self.resolve_relays(relays.as_deref());
        if relays.is_empty() {
            warn!(event = %event.id, "publish without relays");
            return false;
        }

        let mut tasks = JoinSet::new();
        for relay in relays {
            let pool = self.inner.pool.clone();
            let event = event.clone();
            let limit = self.inner.config.publish_timeout;
            tasks.spawn(async move {
                let outcome = time::timeout(limit, pool.publish(&relay, &event)).await;
                (relay, outcome)
            });
        }

        let mut accepted = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Ok(true)))) => accepted += 1,
                Ok((relay, Ok(Ok(false)))) => debug!(relay = %relay, "event rejected"),
                Ok((relay, Ok(Err(e)))) => warn!(relay = %relay, "publish failed: {}", e),
                Ok((relay, Err(_))) => warn!(relay = %relay, "publish timed out"),
                Err(e) => warn!("publish task failed: {}", e),
            }
        }
        debug!(event = %event.id, accepted, "publish finished");
        accepted > 0
    }

    /// Counters of the control task
    pub async fn stats(&self) -> SkeinResult<MultiplexerStats> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Command::Stats { reply }) {
            return Err(SkeinError::ServiceStopped);
        }
        rx.await.map_err(|_| SkeinError::ServiceStopped)
    }

    /// Stop the control task. Open requests are closed; pending snapshots
    /// resolve with their current buffer.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    pub(crate) fn resolve_relays(&self, relays: Option<&[RelayUrl]>) -> Vec<RelayUrl> {
        let relays = relays.unwrap_or(self.inner.config.default_relays.as_slice());
        normalize_relays(relays, self.inner.config.max_relays_per_request)
    }

    fn send(&self, command: Command) -> bool {
        if self.inner.commands.send(command).is_err() {
            debug!("service stopped, command dropped");
            return false;
        }
        true
    }

    fn send_with_closer(&self, command: Command, listener: ListenerId, close: fn(ListenerId) -> Command) -> Closer {
        if !self.send(command) {
            return Closer::inert(listener);
        }
        Closer::new(self.inner.commands.clone(), listener, close)
    }
}

/// Control task: the single owner of the multiplexer
async fn run(mut mux: Multiplexer, mut commands: mpsc::UnboundedReceiver<Command>, mut replies: ReplyReceiver) {
    'control: loop {
        let deadline = mux.next_deadline();
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("all handles dropped");
                    break 'control;
                };
                if apply(&mut mux, command).is_break() {
                    break 'control;
                }
                // Drain what queued up so one wake handles a burst of calls
                while let Ok(command) = commands.try_recv() {
                    if apply(&mut mux, command).is_break() {
                        break 'control;
                    }
                }
            }
            Some(reply) = replies.recv() => {
                mux.handle_reply(reply, Instant::now());
            }
            _ = sleep_until(deadline) => {}
        }
        mux.fire_due(Instant::now());
    }
    mux.shutdown();
}

fn apply(mux: &mut Multiplexer, command: Command) -> ControlFlow<()> {
    let now = Instant::now();
    match command {
        Command::Subscribe {
            listener,
            filters,
            relays,
            priority,
            on_event,
            on_complete,
        } => {
            mux.subscribe(listener, filters, relays, priority, on_event, on_complete, now);
        }
        Command::Query {
            listener,
            filters,
            relays,
            on_event,
            on_complete,
        } => {
            mux.query(listener, filters, relays, Priority::High, on_event, Some(on_complete), now);
        }
        Command::Unsubscribe { listener } => mux.unsubscribe(listener, now),
        Command::RegisterFeed {
            listener,
            feed,
            on_event,
        } => {
            mux.register_feed(listener, feed, on_event, now);
        }
        Command::UnregisterFeed { listener } => mux.unregister_feed(listener, now),
        Command::RequestSnapshot { resolver, feed, reply } => mux.request_snapshot(resolver, feed, reply, now),
        Command::RequestMetadata {
            listener,
            category,
            id,
            on_result,
        } => mux.request_metadata(listener, category, &id, on_result, now),
        Command::CancelMetadata { listener } => mux.cancel_metadata(listener),
        Command::Stats { reply } => {
            let _ = reply.send(mux.stats().clone());
        }
        Command::Shutdown => return ControlFlow::Break(()),
    }
    ControlFlow::Continue(())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => future::pending().await,
    }
}
