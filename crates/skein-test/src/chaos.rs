//! Chaos testing for relay queries
//!
//! Simulates misbehaving relays on top of any pool:
//! - Duplicated events
//! - Reordered events
//! - Dropped events
//!
//! EOSE and CLOSED are never dropped, so a chaotic query still completes.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use skein_core::{Event, Filter, RelayUrl, SkeinResult};
use skein_transport::{RelayMessage, RelayPool, RelayStream};

/// Buffered messages per chaotic query
const QUERY_BUFFER: usize = 256;

/// Chaos configuration
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    /// Probability an event is sent twice
    pub duplicate_prob: f64,
    /// Probability an event is held back and released after later ones
    pub reorder_prob: f64,
    /// Maximum events held back at once
    pub reorder_depth: usize,
    /// Probability an event is silently lost
    pub drop_prob: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        ChaosConfig {
            duplicate_prob: 0.1,
            reorder_prob: 0.1,
            reorder_depth: 3,
            drop_prob: 0.0,
        }
    }
}

impl ChaosConfig {
    /// Every event duplicated, nothing lost
    pub fn echo() -> Self {
        ChaosConfig {
            duplicate_prob: 1.0,
            reorder_prob: 0.0,
            reorder_depth: 0,
            drop_prob: 0.0,
        }
    }

    /// Heavy duplication and reordering, some loss
    pub fn hostile() -> Self {
        ChaosConfig {
            duplicate_prob: 0.5,
            reorder_prob: 0.5,
            reorder_depth: 8,
            drop_prob: 0.1,
        }
    }
}

/// Chaos statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChaosStats {
    pub events_seen: u64,
    pub events_duplicated: u64,
    pub events_reordered: u64,
    pub events_dropped: u64,
}

/// Applies chaos to one query's message stream
pub struct Mangler {
    config: ChaosConfig,
    rng: StdRng,
    held: Vec<Event>,
    stats: ChaosStats,
}

impl Mangler {
    pub fn new(config: ChaosConfig, seed: u64) -> Self {
        Mangler {
            config,
            rng: StdRng::seed_from_u64(seed),
            held: Vec::new(),
            stats: ChaosStats::default(),
        }
    }

    /// Messages to forward for one upstream message
    pub fn push(&mut self, message: RelayMessage) -> Vec<RelayMessage> {
        let event = match message {
            RelayMessage::Event(event) => event,
            other => {
                // Held events go out before the boundary signal
                let mut out = self.release();
                out.push(other);
                return out;
            }
        };

        self.stats.events_seen += 1;
        if self.rng.gen::<f64>() < self.config.drop_prob {
            self.stats.events_dropped += 1;
            return Vec::new();
        }

        let copies = if self.rng.gen::<f64>() < self.config.duplicate_prob {
            self.stats.events_duplicated += 1;
            2
        } else {
            1
        };

        if self.held.len() < self.config.reorder_depth && self.rng.gen::<f64>() < self.config.reorder_prob {
            self.stats.events_reordered += 1;
            for _ in 0..copies {
                self.held.push(event.clone());
            }
            return Vec::new();
        }

        let mut out: Vec<RelayMessage> = (0..copies).map(|_| RelayMessage::Event(event.clone())).collect();
        out.extend(self.release());
        out
    }

    /// Flush everything still held
    pub fn finish(&mut self) -> Vec<RelayMessage> {
        self.release()
    }

    pub fn stats(&self) -> &ChaosStats {
        &self.stats
    }

    fn release(&mut self) -> Vec<RelayMessage> {
        // Newest held first, so held events come out reversed
        self.held.drain(..).rev().map(RelayMessage::Event).collect()
    }
}

/// Relay pool wrapper injecting chaos into every query
#[derive(Clone)]
pub struct ChaosRelayPool<P> {
    inner: P,
    config: ChaosConfig,
    rng: Arc<Mutex<StdRng>>,
    stats: Arc<Mutex<ChaosStats>>,
}

impl<P: RelayPool> ChaosRelayPool<P> {
    pub fn new(inner: P, config: ChaosConfig, seed: u64) -> Self {
        ChaosRelayPool {
            inner,
            config,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
            stats: Arc::new(Mutex::new(ChaosStats::default())),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Totals over all finished queries
    pub fn stats(&self) -> ChaosStats {
        self.stats.lock().clone()
    }
}

#[async_trait]
impl<P: RelayPool> RelayPool for ChaosRelayPool<P> {
    async fn subscribe(&self, relay: &RelayUrl, filters: Vec<Filter>) -> SkeinResult<RelayStream> {
        let mut upstream = self.inner.subscribe(relay, filters).await?;
        let seed = self.rng.lock().gen::<u64>();
        let mut mangler = Mangler::new(self.config.clone(), seed);
        let totals = self.stats.clone();
        let (tx, rx) = mpsc::channel(QUERY_BUFFER);

        tokio::spawn(async move {
            'forward: while let Some(message) = upstream.recv().await {
                for out in mangler.push(message) {
                    if tx.send(out).await.is_err() {
                        break 'forward;
                    }
                }
            }
            for out in mangler.finish() {
                if tx.send(out).await.is_err() {
                    break;
                }
            }

            let stats = mangler.stats();
            let mut totals = totals.lock();
            totals.events_seen += stats.events_seen;
            totals.events_duplicated += stats.events_duplicated;
            totals.events_reordered += stats.events_reordered;
            totals.events_dropped += stats.events_dropped;
        });

        Ok(rx)
    }

    async fn publish(&self, relay: &RelayUrl, event: &Event) -> SkeinResult<bool> {
        self.inner.publish(relay, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{author, timeline};
    use proptest::prelude::*;

    fn events(out: &[RelayMessage]) -> Vec<u64> {
        out.iter()
            .filter_map(|m| match m {
                RelayMessage::Event(e) => Some(e.created_at.0),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_echo_duplicates_everything() {
        let mut mangler = Mangler::new(ChaosConfig::echo(), 7);
        let mut out = Vec::new();
        for event in timeline(&author(1), [1, 2, 3]) {
            out.extend(mangler.push(RelayMessage::Event(event)));
        }
        out.extend(mangler.push(RelayMessage::Eose));

        assert_eq!(events(&out), vec![1, 1, 2, 2, 3, 3]);
        assert_eq!(out.last(), Some(&RelayMessage::Eose));
        assert_eq!(mangler.stats().events_duplicated, 3);
    }

    #[test]
    fn test_held_events_flushed_before_eose() {
        let config = ChaosConfig {
            duplicate_prob: 0.0,
            reorder_prob: 1.0,
            reorder_depth: 2,
            drop_prob: 0.0,
        };
        let mut mangler = Mangler::new(config, 7);
        let mut out = Vec::new();
        for event in timeline(&author(1), [1, 2, 3]) {
            out.extend(mangler.push(RelayMessage::Event(event)));
        }
        // Depth 2: the third event passes and releases the held ones
        assert_eq!(events(&out), vec![3, 2, 1]);

        let last = timeline(&author(1), [4]).remove(0);
        assert!(mangler.push(RelayMessage::Event(last)).is_empty());
        let tail = mangler.push(RelayMessage::Eose);
        assert_eq!(events(&tail), vec![4]);
        assert_eq!(tail.last(), Some(&RelayMessage::Eose));
    }

    #[test]
    fn test_hostile_never_loses_boundaries() {
        let mut mangler = Mangler::new(ChaosConfig::hostile(), 99);
        let mut out = Vec::new();
        for event in timeline(&author(2), 0..200) {
            out.extend(mangler.push(RelayMessage::Event(event)));
        }
        out.extend(mangler.push(RelayMessage::Closed("bye".into())));

        assert!(matches!(out.last(), Some(RelayMessage::Closed(_))));
        let stats = mangler.stats();
        assert_eq!(stats.events_seen, 200);
        assert!(stats.events_dropped > 0);
        assert!(stats.events_duplicated > 0);
    }

    proptest! {
        #[test]
        fn prop_lossless_chaos_keeps_every_event(seed in any::<u64>(), count in 1u64..40) {
            let config = ChaosConfig { drop_prob: 0.0, ..ChaosConfig::hostile() };
            let mut mangler = Mangler::new(config, seed);
            let mut out = Vec::new();
            for event in timeline(&author(3), 0..count) {
                out.extend(mangler.push(RelayMessage::Event(event)));
            }
            out.extend(mangler.push(RelayMessage::Eose));

            let mut times = events(&out);
            times.sort_unstable();
            times.dedup();
            prop_assert_eq!(times, (0..count).collect::<Vec<_>>());
            prop_assert_eq!(out.last(), Some(&RelayMessage::Eose));
        }
    }
}
