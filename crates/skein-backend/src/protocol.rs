//! Backend message protocol
//!
//! Commands flow to the backend, replies flow back, both tagged with the
//! request id. Every reply for a request ends with exactly one terminal
//! `Closed` or `Error`; `Eose` is sent at most once before it.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use skein_core::{Event, Filter, RelayUrl, RequestId};

/// Message to an execution backend
#[derive(Clone, Debug)]
pub enum BackendCommand {
    /// Open a query and stream matching events
    Subscribe {
        request_id: RequestId,
        filters: Vec<Filter>,
        relays: Vec<RelayUrl>,
        cancel: CancellationToken,
    },
    /// Tear down a query
    Close { request_id: RequestId },
}

impl BackendCommand {
    pub fn request_id(&self) -> RequestId {
        match self {
            BackendCommand::Subscribe { request_id, .. } => *request_id,
            BackendCommand::Close { request_id } => *request_id,
        }
    }
}

/// Message from an execution backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendReply {
    /// A verified, deduplicated event
    Event { request_id: RequestId, event: Event },
    /// Every relay exhausted its stored backlog (or the safety timeout hit)
    Eose { request_id: RequestId },
    /// The query ended
    Closed { request_id: RequestId },
    /// The query could not be established or was lost
    Error {
        request_id: Option<RequestId>,
        message: String,
    },
}

impl BackendReply {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            BackendReply::Event { request_id, .. }
            | BackendReply::Eose { request_id }
            | BackendReply::Closed { request_id } => Some(*request_id),
            BackendReply::Error { request_id, .. } => *request_id,
        }
    }

    /// Does this reply end the request?
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackendReply::Closed { .. } | BackendReply::Error { .. })
    }
}

/// Channel carrying replies back to the orchestration layer
pub type ReplySender = mpsc::UnboundedSender<BackendReply>;

/// Receiving half of [`ReplySender`]
pub type ReplyReceiver = mpsc::UnboundedReceiver<BackendReply>;

/// Which implementation is executing requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Offloaded,
    InProcess,
    Recording,
}

/// Contract shared by every execution backend.
///
/// `dispatch` never blocks and never fails: problems are reported as
/// `BackendReply::Error` on the reply channel.
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn dispatch(&self, command: BackendCommand);
}
