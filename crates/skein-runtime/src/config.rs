//! Service configuration
//!
//! Every tunable has a default; `from_env` overlays `SKEIN_*` variables.
//! Durations use humantime syntax such as `250ms` or `4s`.

use std::env;
use std::time::Duration;

use skein_backend::ExecutorConfig;
use skein_core::{RelayUrl, SkeinError, SkeinResult, DEFAULT_SEEN_CAPACITY};

/// Relays used when a request names none
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://relay.primal.net",
];

/// Skein service configuration
#[derive(Clone, Debug)]
pub struct SkeinConfig {
    /// Concurrency ceiling for admitted requests
    pub max_concurrent: usize,
    /// Minimum interval between admission bursts
    pub pacing: Duration,
    /// Fan-out cap per request
    pub max_relays_per_request: usize,
    pub default_relays: Vec<RelayUrl>,
    /// Metadata debounce window
    pub metadata_window: Duration,
    /// A metadata batch subscription is closed this long after its flush
    pub metadata_batch_lifetime: Duration,
    /// Pending snapshots resolve with whatever is buffered after this long
    pub snapshot_timeout: Duration,
    /// Single-item lookups
    pub lookup_timeout: Duration,
    /// Community discovery scans
    pub discovery_timeout: Duration,
    pub relay_list_timeout: Duration,
    /// EOSE safety net inside the backend
    pub eose_timeout: Duration,
    pub publish_timeout: Duration,
    /// Execute on a dedicated worker thread instead of in-process
    pub offload: bool,
}

impl Default for SkeinConfig {
    fn default() -> Self {
        SkeinConfig {
            max_concurrent: 10,
            pacing: Duration::from_millis(250),
            max_relays_per_request: 8,
            default_relays: DEFAULT_RELAYS
                .iter()
                .filter_map(|r| RelayUrl::parse(r).ok())
                .collect(),
            metadata_window: Duration::from_millis(1500),
            metadata_batch_lifetime: Duration::from_secs(10),
            snapshot_timeout: Duration::from_secs(4),
            lookup_timeout: Duration::from_secs(2),
            discovery_timeout: Duration::from_secs(8),
            relay_list_timeout: Duration::from_secs(4),
            eose_timeout: Duration::from_secs(12),
            publish_timeout: Duration::from_secs(8),
            offload: true,
        }
    }
}

impl SkeinConfig {
    /// Defaults overlaid with `SKEIN_*` environment variables
    pub fn from_env() -> SkeinResult<Self> {
        let mut config = Self::default();

        if let Some(v) = env_usize("SKEIN_MAX_CONCURRENT")? {
            config.max_concurrent = v;
        }
        if let Some(v) = env_duration("SKEIN_PACING")? {
            config.pacing = v;
        }
        if let Some(v) = env_usize("SKEIN_MAX_RELAYS")? {
            config.max_relays_per_request = v;
        }
        if let Some(raw) = env_string("SKEIN_RELAYS") {
            config.default_relays = raw
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(RelayUrl::parse)
                .collect::<SkeinResult<Vec<_>>>()
                .map_err(|e| SkeinError::InvalidConfig(format!("SKEIN_RELAYS: {}", e)))?;
        }
        if let Some(v) = env_duration("SKEIN_METADATA_WINDOW")? {
            config.metadata_window = v;
        }
        if let Some(v) = env_duration("SKEIN_METADATA_LIFETIME")? {
            config.metadata_batch_lifetime = v;
        }
        if let Some(v) = env_duration("SKEIN_SNAPSHOT_TIMEOUT")? {
            config.snapshot_timeout = v;
        }
        if let Some(v) = env_duration("SKEIN_LOOKUP_TIMEOUT")? {
            config.lookup_timeout = v;
        }
        if let Some(v) = env_duration("SKEIN_DISCOVERY_TIMEOUT")? {
            config.discovery_timeout = v;
        }
        if let Some(v) = env_duration("SKEIN_RELAY_LIST_TIMEOUT")? {
            config.relay_list_timeout = v;
        }
        if let Some(v) = env_duration("SKEIN_EOSE_TIMEOUT")? {
            config.eose_timeout = v;
        }
        if let Some(v) = env_duration("SKEIN_PUBLISH_TIMEOUT")? {
            config.publish_timeout = v;
        }
        if let Some(raw) = env_string("SKEIN_OFFLOAD") {
            config.offload = parse_bool(&raw)
                .ok_or_else(|| SkeinError::InvalidConfig(format!("SKEIN_OFFLOAD: {:?}", raw)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> SkeinResult<()> {
        if self.max_concurrent == 0 {
            return Err(SkeinError::InvalidConfig("max_concurrent must be at least 1".into()));
        }
        if self.max_relays_per_request == 0 {
            return Err(SkeinError::InvalidConfig(
                "max_relays_per_request must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Settings handed to the execution backend
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            eose_timeout: self.eose_timeout,
            verify: true,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_usize(name: &str) -> SkeinResult<Option<usize>> {
    env_string(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| SkeinError::InvalidConfig(format!("{}: not a number: {:?}", name, raw)))
        })
        .transpose()
}

fn env_duration(name: &str) -> SkeinResult<Option<Duration>> {
    env_string(name)
        .map(|raw| {
            humantime::parse_duration(raw.trim())
                .map_err(|e| SkeinError::InvalidConfig(format!("{}: {}", name, e)))
        })
        .transpose()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
