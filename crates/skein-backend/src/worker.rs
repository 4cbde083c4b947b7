//! Offloaded backend: the executor runs on a dedicated OS thread with its
//! own single-threaded runtime. The orchestration side only exchanges
//! messages with it.
//!
//! Events crossing back are deduplicated again per request before they are
//! forwarded, so a redelivery at the thread boundary never reaches callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, error};

use skein_core::{RequestId, SeenSet, SkeinError, SkeinResult};
use skein_transport::RelayPool;

use crate::{BackendCommand, BackendKind, BackendReply, ExecutionBackend, Executor, ExecutorConfig, ReplySender};

/// Worker thread name
const WORKER_THREAD: &str = "skein-worker";

/// Executes requests on a dedicated worker thread
pub struct WorkerBackend {
    commands: mpsc::UnboundedSender<BackendCommand>,
    replies: ReplySender,
}

impl WorkerBackend {
    /// Start the worker thread and the reply forwarder.
    ///
    /// Must be called from within a tokio runtime (the forwarder runs there).
    pub fn spawn(pool: Arc<dyn RelayPool>, replies: ReplySender, config: ExecutorConfig) -> SkeinResult<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let seen_capacity = config.seen_capacity;

        thread::Builder::new()
            .name(WORKER_THREAD.into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("worker runtime failed to start: {}", e);
                        return;
                    }
                };
                runtime.block_on(Executor::new(pool, worker_tx, config).run(command_rx));
                debug!("worker thread exiting");
            })
            .map_err(|e| SkeinError::TransportError(format!("worker thread: {}", e)))?;

        tokio::spawn(forward_replies(worker_rx, replies.clone(), seen_capacity));

        Ok(Self { commands, replies })
    }
}

impl ExecutionBackend for WorkerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Offloaded
    }

    fn dispatch(&self, command: BackendCommand) {
        let request_id = command.request_id();
        if self.commands.send(command).is_err() {
            let _ = self.replies.send(BackendReply::Error {
                request_id: Some(request_id),
                message: "worker stopped".into(),
            });
        }
    }
}

async fn forward_replies(
    mut worker_rx: mpsc::UnboundedReceiver<BackendReply>,
    replies: ReplySender,
    seen_capacity: usize,
) {
    let mut seen: HashMap<RequestId, SeenSet> = HashMap::new();

    while let Some(reply) = worker_rx.recv().await {
        if let BackendReply::Event { request_id, event } = &reply {
            let fresh = seen
                .entry(*request_id)
                .or_insert_with(|| SeenSet::new(seen_capacity))
                .insert(event.id);
            if !fresh {
                continue;
            }
        } else if reply.is_terminal() {
            if let Some(request_id) = reply.request_id() {
                seen.remove(&request_id);
            }
        }

        if replies.send(reply).is_err() {
            break;
        }
    }
}
