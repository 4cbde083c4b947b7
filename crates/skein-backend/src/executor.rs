//! Request executor
//!
//! One executor serves many requests. For each `Subscribe` it opens a leg
//! per `relay × filter` pair, merges the legs into one stream, drops events
//! that fail verification or were already delivered for the request, and
//! signals EOSE once: when every leg has exhausted its backlog, or when the
//! safety timeout fires, whichever comes first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skein_core::{Event, Filter, RelayUrl, RequestId, SeenSet, DEFAULT_SEEN_CAPACITY};
use skein_crypto::is_authentic;
use skein_transport::{RelayMessage, RelayPool};

use crate::{BackendCommand, BackendReply, ReplySender};

/// Buffered messages between legs and their request
const LEG_BUFFER: usize = 256;

/// Executor configuration
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// EOSE is reported after this long even if some relay never sent one
    pub eose_timeout: Duration,
    /// Drop events whose id or signature does not check out
    pub verify: bool,
    /// Per-request duplicate window
    pub seen_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            eose_timeout: Duration::from_secs(12),
            verify: true,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
        }
    }
}

enum LegEvent {
    Event(Event),
    Eose,
    Failed { relay: RelayUrl, reason: String },
}

/// Executes backend commands against a relay pool
pub struct Executor {
    pool: Arc<dyn RelayPool>,
    replies: ReplySender,
    config: ExecutorConfig,
    active: HashMap<RequestId, CancellationToken>,
}

impl Executor {
    pub fn new(pool: Arc<dyn RelayPool>, replies: ReplySender, config: ExecutorConfig) -> Self {
        Self {
            pool,
            replies,
            config,
            active: HashMap::new(),
        }
    }

    /// Serve commands until the command channel closes.
    ///
    /// Requests still running at that point are cancelled.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<BackendCommand>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<RequestId>();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command, &done_tx),
                    None => break,
                },
                Some(finished) = done_rx.recv() => {
                    self.active.remove(&finished);
                }
            }
        }

        for (_, token) in self.active.drain() {
            token.cancel();
        }
        debug!("executor stopped");
    }

    fn handle(&mut self, command: BackendCommand, done: &mpsc::UnboundedSender<RequestId>) {
        match command {
            BackendCommand::Subscribe {
                request_id,
                filters,
                relays,
                cancel,
            } => {
                if filters.is_empty() || relays.is_empty() {
                    let _ = self.replies.send(BackendReply::Error {
                        request_id: Some(request_id),
                        message: "request needs at least one filter and one relay".into(),
                    });
                    return;
                }

                debug!(request = %request_id, relays = relays.len(), filters = filters.len(), "opening request");
                self.active.insert(request_id, cancel.clone());

                let request = Request {
                    id: request_id,
                    pool: self.pool.clone(),
                    filters,
                    relays,
                    cancel,
                    replies: self.replies.clone(),
                    config: self.config.clone(),
                };
                let done = done.clone();
                tokio::spawn(async move {
                    request.run().await;
                    let _ = done.send(request_id);
                });
            }
            BackendCommand::Close { request_id } => match self.active.remove(&request_id) {
                Some(token) => token.cancel(),
                None => debug!(request = %request_id, "close for unknown request"),
            },
        }
    }
}

struct Request {
    id: RequestId,
    pool: Arc<dyn RelayPool>,
    filters: Vec<Filter>,
    relays: Vec<RelayUrl>,
    cancel: CancellationToken,
    replies: ReplySender,
    config: ExecutorConfig,
}

impl Request {
    async fn run(self) {
        let (leg_tx, mut leg_rx) = mpsc::channel(LEG_BUFFER);
        let mut legs = 0usize;

        for relay in &self.relays {
            for filter in &self.filters {
                legs += 1;
                tokio::spawn(run_leg(
                    self.pool.clone(),
                    relay.clone(),
                    filter.clone(),
                    leg_tx.clone(),
                    self.cancel.child_token(),
                ));
            }
        }
        drop(leg_tx);

        let mut unsettled = legs;
        let mut failed = 0usize;
        let mut eose_sent = false;
        let mut seen = SeenSet::new(self.config.seen_capacity);

        let eose_deadline = tokio::time::sleep(self.config.eose_timeout);
        tokio::pin!(eose_deadline);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.reply(BackendReply::Closed { request_id: self.id });
                    return;
                }

                _ = &mut eose_deadline, if !eose_sent => {
                    debug!(request = %self.id, unsettled, "EOSE timeout");
                    eose_sent = true;
                    self.reply(BackendReply::Eose { request_id: self.id });
                }

                leg = leg_rx.recv() => match leg {
                    Some(LegEvent::Event(event)) => {
                        if self.config.verify && !is_authentic(&event) {
                            continue;
                        }
                        if seen.insert(event.id) {
                            self.reply(BackendReply::Event { request_id: self.id, event });
                        }
                    }
                    Some(LegEvent::Eose) => {
                        unsettled -= 1;
                        if unsettled == 0 && !eose_sent {
                            eose_sent = true;
                            self.reply(BackendReply::Eose { request_id: self.id });
                        }
                    }
                    Some(LegEvent::Failed { relay, reason }) => {
                        unsettled -= 1;
                        failed += 1;
                        warn!(request = %self.id, relay = %relay, "relay leg failed: {}", reason);

                        if failed == legs {
                            self.reply(BackendReply::Error {
                                request_id: Some(self.id),
                                message: format!("all {} relay queries failed", legs),
                            });
                            return;
                        }
                        if unsettled == 0 && !eose_sent {
                            eose_sent = true;
                            self.reply(BackendReply::Eose { request_id: self.id });
                        }
                    }
                    None => {
                        // Every leg has ended
                        if !eose_sent {
                            self.reply(BackendReply::Eose { request_id: self.id });
                        }
                        self.reply(BackendReply::Closed { request_id: self.id });
                        return;
                    }
                },
            }
        }
    }

    fn reply(&self, reply: BackendReply) {
        if self.replies.send(reply).is_err() {
            // Receiver gone; the service is shutting down
            self.cancel.cancel();
        }
    }
}

/// One relay, one filter. Sends at most one of `Eose` / `Failed`.
async fn run_leg(
    pool: Arc<dyn RelayPool>,
    relay: RelayUrl,
    filter: Filter,
    tx: mpsc::Sender<LegEvent>,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = pool.subscribe(&relay, vec![filter]) => opened,
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx
                .send(LegEvent::Failed {
                    relay,
                    reason: e.to_string(),
                })
                .await;
            return;
        }
    };

    let mut eosed = false;
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = stream.recv() => message,
        };

        match message {
            Some(RelayMessage::Event(event)) => {
                if tx.send(LegEvent::Event(event)).await.is_err() {
                    return;
                }
            }
            Some(RelayMessage::Eose) => {
                if !eosed {
                    eosed = true;
                    if tx.send(LegEvent::Eose).await.is_err() {
                        return;
                    }
                }
            }
            Some(RelayMessage::Closed(reason)) => {
                if !eosed {
                    let _ = tx.send(LegEvent::Failed { relay, reason }).await;
                }
                return;
            }
            None => {
                if !eosed {
                    let _ = tx
                        .send(LegEvent::Failed {
                            relay,
                            reason: "stream ended before EOSE".into(),
                        })
                        .await;
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::{Kind, Signature, Timestamp, UnsignedEvent};
    use skein_crypto::Keys;
    use skein_transport::MemoryRelayPool;

    fn relay(name: &str) -> RelayUrl {
        RelayUrl::parse(&format!("wss://{}.test", name)).unwrap()
    }

    fn signed(keys: &Keys, created_at: u64, content: &str) -> Event {
        keys.sign_event(UnsignedEvent::new(
            keys.public_key(),
            Timestamp(created_at),
            Kind::TEXT_NOTE,
            content,
        ))
    }

    fn start(pool: MemoryRelayPool, config: ExecutorConfig) -> (mpsc::UnboundedSender<BackendCommand>, mpsc::UnboundedReceiver<BackendReply>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        tokio::spawn(Executor::new(Arc::new(pool), reply_tx, config).run(cmd_rx));
        (cmd_tx, reply_rx)
    }

    fn subscribe(id: u64, relays: Vec<RelayUrl>) -> (BackendCommand, CancellationToken) {
        let cancel = CancellationToken::new();
        let command = BackendCommand::Subscribe {
            request_id: RequestId::new(id),
            filters: vec![Filter::new().kind(Kind::TEXT_NOTE)],
            relays,
            cancel: cancel.clone(),
        };
        (command, cancel)
    }

    #[tokio::test]
    async fn test_dedup_across_relays_then_single_eose() {
        let (a, b) = (relay("a"), relay("b"));
        let pool = MemoryRelayPool::with_relays([&a, &b]);
        let keys = Keys::generate();
        let shared = signed(&keys, 10, "on both");
        pool.insert(&a, shared.clone());
        pool.insert(&b, shared.clone());
        pool.insert(&b, signed(&keys, 5, "only b"));

        let (cmd, mut replies) = start(pool, ExecutorConfig::default());
        cmd.send(subscribe(1, vec![a, b]).0).unwrap();

        let mut events = Vec::new();
        loop {
            match replies.recv().await.unwrap() {
                BackendReply::Event { event, .. } => events.push(event),
                BackendReply::Eose { request_id } => {
                    assert_eq!(request_id, RequestId::new(1));
                    break;
                }
                other => panic!("unexpected reply {:?}", other),
            }
        }
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_unverifiable_events_dropped() {
        let a = relay("a");
        let pool = MemoryRelayPool::with_relays([&a]);
        let keys = Keys::generate();
        pool.insert(&a, signed(&keys, 2, "good"));

        let unsigned = UnsignedEvent::new(keys.public_key(), Timestamp(3), Kind::TEXT_NOTE, "forged");
        let id = unsigned.id();
        pool.insert(&a, unsigned.into_event(id, Signature::from_bytes([9; 64])));

        let (cmd, mut replies) = start(pool, ExecutorConfig::default());
        cmd.send(subscribe(7, vec![a]).0).unwrap();

        match replies.recv().await.unwrap() {
            BackendReply::Event { event, .. } => assert_eq!(event.content, "good"),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(matches!(replies.recv().await.unwrap(), BackendReply::Eose { .. }));
    }

    #[tokio::test]
    async fn test_all_relays_failing_reports_error() {
        let a = relay("a");
        let pool = MemoryRelayPool::with_relays([&a]);
        pool.set_online(&a, false);

        let (cmd, mut replies) = start(pool, ExecutorConfig::default());
        cmd.send(subscribe(3, vec![a, relay("unknown")]).0).unwrap();

        match replies.recv().await.unwrap() {
            BackendReply::Error { request_id, .. } => assert_eq!(request_id, Some(RequestId::new(3))),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_failure_still_completes() {
        let a = relay("a");
        let pool = MemoryRelayPool::with_relays([&a]);

        let (cmd, mut replies) = start(pool, ExecutorConfig::default());
        cmd.send(subscribe(4, vec![a, relay("down")]).0).unwrap();

        assert_eq!(
            replies.recv().await.unwrap(),
            BackendReply::Eose { request_id: RequestId::new(4) }
        );
    }

    #[tokio::test]
    async fn test_close_ends_with_closed() {
        let a = relay("a");
        let pool = MemoryRelayPool::with_relays([&a]);

        let (cmd, mut replies) = start(pool, ExecutorConfig::default());
        cmd.send(subscribe(5, vec![a]).0).unwrap();
        assert!(matches!(replies.recv().await.unwrap(), BackendReply::Eose { .. }));

        cmd.send(BackendCommand::Close { request_id: RequestId::new(5) }).unwrap();
        assert_eq!(
            replies.recv().await.unwrap(),
            BackendReply::Closed { request_id: RequestId::new(5) }
        );
    }

    #[tokio::test]
    async fn test_live_events_after_eose() {
        let a = relay("a");
        let pool = MemoryRelayPool::with_relays([&a]);
        let keys = Keys::generate();

        let (cmd, mut replies) = start(pool.clone(), ExecutorConfig::default());
        cmd.send(subscribe(6, vec![a.clone()]).0).unwrap();
        assert!(matches!(replies.recv().await.unwrap(), BackendReply::Eose { .. }));

        pool.publish(&a, &signed(&keys, 99, "live")).await.unwrap();
        match replies.recv().await.unwrap() {
            BackendReply::Event { event, .. } => assert_eq!(event.content, "live"),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_request_rejected() {
        let (cmd, mut replies) = start(MemoryRelayPool::new(), ExecutorConfig::default());
        cmd.send(subscribe(8, vec![]).0).unwrap();
        assert!(matches!(replies.recv().await.unwrap(), BackendReply::Error { .. }));
    }

    #[test]
    fn test_default_config() {
        let config = ExecutorConfig::default();
        assert_eq!(config.eose_timeout, Duration::from_secs(12));
        assert!(config.verify);
    }
}
