//! Recording backend for tests
//!
//! Records every command it receives and lets the test inject replies as if
//! relays had answered.

use std::sync::Arc;

use parking_lot::Mutex;

use skein_core::{Filter, RelayUrl, RequestId};

use crate::{BackendCommand, BackendKind, BackendReply, ExecutionBackend, ReplySender};

#[derive(Default)]
struct Recording {
    commands: Vec<BackendCommand>,
    replies: Option<ReplySender>,
}

/// Instrumented backend that never touches the network
#[derive(Clone, Default)]
pub struct RecordingBackend {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect the reply channel used by [`RecordingBackend::reply`]
    pub fn attach(&self, replies: ReplySender) {
        self.inner.lock().replies = Some(replies);
    }

    /// Inject a reply. Returns false if nothing is attached or listening.
    pub fn reply(&self, reply: BackendReply) -> bool {
        match &self.inner.lock().replies {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// All commands in arrival order
    pub fn commands(&self) -> Vec<BackendCommand> {
        self.inner.lock().commands.clone()
    }

    /// Subscribe commands as `(request, filters, relays)`
    pub fn subscriptions(&self) -> Vec<(RequestId, Vec<Filter>, Vec<RelayUrl>)> {
        self.inner
            .lock()
            .commands
            .iter()
            .filter_map(|c| match c {
                BackendCommand::Subscribe {
                    request_id,
                    filters,
                    relays,
                    ..
                } => Some((*request_id, filters.clone(), relays.clone())),
                BackendCommand::Close { .. } => None,
            })
            .collect()
    }

    /// Requests that received a `Close`
    pub fn closed(&self) -> Vec<RequestId> {
        self.inner
            .lock()
            .commands
            .iter()
            .filter_map(|c| match c {
                BackendCommand::Close { request_id } => Some(*request_id),
                BackendCommand::Subscribe { .. } => None,
            })
            .collect()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscriptions().len()
    }

    /// Subscribed and neither closed nor cancelled
    pub fn open_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .commands
            .iter()
            .filter(|c| match c {
                BackendCommand::Subscribe { request_id, cancel, .. } => {
                    !cancel.is_cancelled()
                        && !inner
                            .commands
                            .iter()
                            .any(|o| matches!(o, BackendCommand::Close { request_id: r } if r == request_id))
                }
                BackendCommand::Close { .. } => false,
            })
            .count()
    }

    /// Most recent subscribe
    pub fn last_subscription(&self) -> Option<(RequestId, Vec<Filter>, Vec<RelayUrl>)> {
        self.subscriptions().pop()
    }
}

impl ExecutionBackend for RecordingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Recording
    }

    fn dispatch(&self, command: BackendCommand) {
        tracing::trace!(request = %command.request_id(), "recorded backend command");
        self.inner.lock().commands.push(command);
    }
}
