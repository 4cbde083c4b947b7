//! In-process backend: the executor runs as a task on the current runtime

use std::sync::Arc;

use tokio::sync::mpsc;

use skein_transport::RelayPool;

use crate::{BackendCommand, BackendKind, BackendReply, ExecutionBackend, Executor, ExecutorConfig, ReplySender};

/// Executes requests on the caller's tokio runtime
pub struct InlineBackend {
    commands: mpsc::UnboundedSender<BackendCommand>,
    replies: ReplySender,
}

impl InlineBackend {
    /// Spawn the executor task. Must be called from within a tokio runtime.
    pub fn spawn(pool: Arc<dyn RelayPool>, replies: ReplySender, config: ExecutorConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(Executor::new(pool, replies.clone(), config).run(rx));
        Self { commands, replies }
    }
}

impl ExecutionBackend for InlineBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    fn dispatch(&self, command: BackendCommand) {
        let request_id = command.request_id();
        if self.commands.send(command).is_err() {
            let _ = self.replies.send(BackendReply::Error {
                request_id: Some(request_id),
                message: "executor stopped".into(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::{Filter, RelayUrl, RequestId};
    use skein_transport::MemoryRelayPool;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_inline_round_trip() {
        let relay = RelayUrl::parse("wss://inline.test").unwrap();
        let pool = MemoryRelayPool::with_relays([&relay]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = InlineBackend::spawn(Arc::new(pool), tx, ExecutorConfig::default());
        assert_eq!(backend.kind(), BackendKind::InProcess);

        backend.dispatch(BackendCommand::Subscribe {
            request_id: RequestId::new(1),
            filters: vec![Filter::new()],
            relays: vec![relay],
            cancel: CancellationToken::new(),
        });
        assert_eq!(rx.recv().await, Some(BackendReply::Eose { request_id: RequestId::new(1) }));

        backend.dispatch(BackendCommand::Close { request_id: RequestId::new(1) });
        assert_eq!(rx.recv().await, Some(BackendReply::Closed { request_id: RequestId::new(1) }));
    }
}
