//! Backend selection
//!
//! Prefer the offloaded worker when asked for; if the worker cannot be
//! started, fall back to in-process execution with a warning.

use std::sync::Arc;

use tracing::{info, warn};

use skein_transport::RelayPool;

use crate::{ExecutionBackend, ExecutorConfig, InlineBackend, ReplySender, WorkerBackend};

/// Build the execution backend for a service instance
pub fn select_backend(
    pool: Arc<dyn RelayPool>,
    replies: ReplySender,
    config: ExecutorConfig,
    offload: bool,
) -> Arc<dyn ExecutionBackend> {
    if offload {
        match WorkerBackend::spawn(pool.clone(), replies.clone(), config.clone()) {
            Ok(worker) => {
                info!("executing requests on worker thread");
                return Arc::new(worker);
            }
            Err(e) => warn!("offloaded execution unavailable, running in-process: {}", e),
        }
    }
    Arc::new(InlineBackend::spawn(pool, replies, config))
}
