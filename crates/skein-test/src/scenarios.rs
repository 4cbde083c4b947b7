//! End-to-end scenarios
//!
//! Tests that drive the public `Skein` handle through the whole request
//! path:
//! - Dedup by key and ref-counted teardown
//! - Priority escalation and the concurrency ceiling
//! - Feed buffer cap and order
//! - Per-listener dedup under relay chaos
//! - Community discovery merge and metadata batching

use std::sync::Arc;

use skein_backend::{ExecutionBackend, RecordingBackend};
use skein_core::{Event, RelayUrl};
use skein_runtime::{Skein, SkeinConfig};
use skein_transport::{MemoryRelayPool, RelayPool};

// ============================================================================
// SCENARIO HARNESS
// ============================================================================

/// Configuration for scenarios: in-process execution over `relays`
pub fn scenario_config(relays: Vec<RelayUrl>) -> SkeinConfig {
    SkeinConfig {
        default_relays: relays,
        offload: false,
        ..SkeinConfig::default()
    }
}

/// A service over an in-memory relay set
pub struct Scenario {
    pub skein: Skein,
    pub pool: MemoryRelayPool,
    pub relays: Vec<RelayUrl>,
}

impl Scenario {
    /// Start over `relays` with every event of `history` stored on each
    pub fn start(relays: Vec<RelayUrl>, history: &[Event]) -> Self {
        Self::start_with(relays, history, |pool| Arc::new(pool) as Arc<dyn RelayPool>)
    }

    /// Like [`Scenario::start`], wrapping the pool before the service sees it
    pub fn start_with<F>(relays: Vec<RelayUrl>, history: &[Event], wrap: F) -> Self
    where
        F: FnOnce(MemoryRelayPool) -> Arc<dyn RelayPool>,
    {
        let pool = MemoryRelayPool::with_relays(&relays);
        for relay in &relays {
            for event in history {
                pool.insert(relay, event.clone());
            }
        }
        let skein = Skein::start(scenario_config(relays.clone()), wrap(pool.clone()))
            .expect("scenario config is valid");
        Scenario { skein, pool, relays }
    }
}

/// A service whose backend only records commands
pub fn recorded(config: SkeinConfig) -> (Skein, RecordingBackend) {
    let recording = RecordingBackend::new();
    let backend = recording.clone();
    let skein = Skein::start_with_backend(config, Arc::new(MemoryRelayPool::new()), move |replies| {
        backend.attach(replies);
        Arc::new(backend) as Arc<dyn ExecutionBackend>
    })
    .expect("scenario config is valid");
    (skein, recording)
}
