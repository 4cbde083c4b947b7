//! Community and relay-list discovery
//!
//! Both are scans over the request path with a longer timeout than plain
//! lookups. Community results are merged with an external local cache.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use skein_core::{Event, EventId, Filter, Kind, PublicKey, RelayUrl, Timestamp};

use crate::Skein;

/// An addressable community definition, identified by `(creator, d tag)`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    pub creator: PublicKey,
    pub identifier: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_at: Timestamp,
    pub event_id: EventId,
}

impl Community {
    /// Read a community definition; `None` for other kinds or a missing
    /// `d` tag.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != Kind::COMMUNITY {
            return None;
        }
        let identifier = event.identifier()?.to_string();
        Some(Community {
            creator: event.pubkey,
            identifier,
            name: event.first_tag_value("name").map(str::to_string),
            description: event.first_tag_value("description").map(str::to_string),
            created_at: event.created_at,
            event_id: event.id,
        })
    }

    pub fn address(&self) -> (PublicKey, &str) {
        (self.creator, &self.identifier)
    }
}

/// Merge cached and freshly scanned communities.
///
/// One entry per `(creator, identifier)`, the newest definition winning;
/// ordered newest first.
pub fn merge_communities(cached: Vec<Community>, scanned: Vec<Community>) -> Vec<Community> {
    let mut merged: HashMap<(PublicKey, String), Community> = HashMap::new();
    for community in cached.into_iter().chain(scanned) {
        let address = (community.creator, community.identifier.clone());
        match merged.get(&address) {
            Some(held) if held.created_at >= community.created_at => {}
            _ => {
                merged.insert(address, community);
            }
        }
    }

    let mut out: Vec<Community> = merged.into_values().collect();
    out.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.creator.cmp(&b.creator))
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
    out
}

/// Local store of known communities, owned outside the core
pub trait CommunityCache: Send + Sync {
    fn load(&self) -> Vec<Community>;
    fn store(&self, communities: &[Community]);
}

/// In-memory [`CommunityCache`]
#[derive(Debug, Default)]
pub struct MemoryCommunityCache {
    communities: Mutex<Vec<Community>>,
}

impl MemoryCommunityCache {
    pub fn new(communities: Vec<Community>) -> Self {
        MemoryCommunityCache {
            communities: Mutex::new(communities),
        }
    }
}

impl CommunityCache for MemoryCommunityCache {
    fn load(&self) -> Vec<Community> {
        self.communities.lock().clone()
    }

    fn store(&self, communities: &[Community]) {
        *self.communities.lock() = communities.to_vec();
    }
}

/// Relays an author reads from and writes to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayList {
    pub author: PublicKey,
    pub read: Vec<RelayUrl>,
    pub write: Vec<RelayUrl>,
    pub created_at: Timestamp,
}

impl RelayList {
    /// Read `r` tags of a relay list event. Unmarked relays count for
    /// both directions; unparseable urls are skipped.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != Kind::RELAY_LIST {
            return None;
        }
        let mut list = RelayList {
            author: event.pubkey,
            read: Vec::new(),
            write: Vec::new(),
            created_at: event.created_at,
        };
        for tag in event.tags.iter().filter(|t| t.first().map(String::as_str) == Some("r")) {
            let Some(url) = tag.get(1).and_then(|raw| RelayUrl::parse(raw).ok()) else {
                debug!(event = %event.id, "skipping malformed relay tag");
                continue;
            };
            let marker = tag.get(2).map(String::as_str);
            if marker != Some("write") && !list.read.contains(&url) {
                list.read.push(url.clone());
            }
            if marker != Some("read") && !list.write.contains(&url) {
                list.write.push(url);
            }
        }
        Some(list)
    }
}

impl Skein {
    /// Scan for community definitions, merge with the cache and store the
    /// merged set back.
    pub async fn discover_communities(
        &self,
        relays: Option<Vec<RelayUrl>>,
        cache: &dyn CommunityCache,
    ) -> Vec<Community> {
        let cached = cache.load();
        let events = self
            .query(
                vec![Filter::new().kind(Kind::COMMUNITY)],
                relays,
                self.config().discovery_timeout,
            )
            .await;
        let scanned: Vec<Community> = events.iter().filter_map(Community::from_event).collect();

        let merged = merge_communities(cached, scanned);
        cache.store(&merged);
        info!(communities = merged.len(), "community discovery finished");
        merged
    }

    /// Latest relay list published by `author`
    pub async fn fetch_relay_list(&self, author: PublicKey, relays: Option<Vec<RelayUrl>>) -> Option<RelayList> {
        let filter = Filter::new().authors([author]).kind(Kind::RELAY_LIST);
        self.query(vec![filter], relays, self.config().relay_list_timeout)
            .await
            .iter()
            .filter(|e| e.pubkey == author)
            .find_map(RelayList::from_event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SkeinConfig;
    use skein_core::UnsignedEvent;
    use skein_crypto::Keys;
    use skein_transport::MemoryRelayPool;
    use std::sync::Arc;

    fn community(keys: &Keys, d: &str, name: &str, created_at: u64) -> Event {
        keys.sign_event(
            UnsignedEvent::new(keys.public_key(), Timestamp(created_at), Kind::COMMUNITY, "")
                .tag(["d", d])
                .tag(["name", name]),
        )
    }

    fn parsed(event: &Event) -> Community {
        Community::from_event(event).unwrap()
    }

    #[test]
    fn test_from_event_requires_identifier() {
        let keys = Keys::from_bytes(&[1; 32]);
        let ok = community(&keys, "rust", "Rust", 5);
        assert_eq!(parsed(&ok).name.as_deref(), Some("Rust"));

        let no_d = keys.sign_event(UnsignedEvent::new(keys.public_key(), Timestamp(5), Kind::COMMUNITY, ""));
        assert_eq!(Community::from_event(&no_d), None);
    }

    #[test]
    fn test_merge_keeps_one_per_address() {
        let alice = Keys::from_bytes(&[1; 32]);
        let bob = Keys::from_bytes(&[2; 32]);
        let a_cached = parsed(&community(&alice, "a", "A", 10));
        let a_scanned = parsed(&community(&alice, "a", "A", 10));
        let b = parsed(&community(&bob, "b", "B", 20));

        let merged = merge_communities(vec![a_cached], vec![a_scanned, b.clone()]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], b);
        assert_eq!(merged[1].address(), (alice.public_key(), "a"));
    }

    #[test]
    fn test_merge_prefers_newest_definition() {
        let alice = Keys::from_bytes(&[1; 32]);
        let old = parsed(&community(&alice, "a", "Old", 10));
        let new = parsed(&community(&alice, "a", "New", 30));

        let merged = merge_communities(vec![new.clone()], vec![old]);
        assert_eq!(merged, vec![new]);
    }

    #[test]
    fn test_relay_list_markers() {
        let keys = Keys::from_bytes(&[3; 32]);
        let event = keys.sign_event(
            UnsignedEvent::new(keys.public_key(), Timestamp(1), Kind::RELAY_LIST, "")
                .tag(["r", "wss://both.test"])
                .tag(["r", "wss://in.test", "read"])
                .tag(["r", "wss://out.test/", "write"])
                .tag(["r", "https://not-a-relay.test"]),
        );
        let list = RelayList::from_event(&event).unwrap();
        let urls = |v: &[RelayUrl]| v.iter().map(|r| r.as_str().to_string()).collect::<Vec<_>>();

        assert_eq!(urls(&list.read), vec!["wss://both.test", "wss://in.test"]);
        assert_eq!(urls(&list.write), vec!["wss://both.test", "wss://out.test"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_merges_cache_and_scan() {
        let relay = RelayUrl::parse("wss://communities.test").unwrap();
        let pool = MemoryRelayPool::with_relays([&relay]);
        let alice = Keys::generate();
        let bob = Keys::generate();
        let a = community(&alice, "a", "A", 10);
        pool.insert(&relay, a.clone());
        pool.insert(&relay, community(&bob, "b", "B", 20));

        let config = SkeinConfig {
            default_relays: vec![relay],
            offload: false,
            ..SkeinConfig::default()
        };
        let skein = Skein::start(config, Arc::new(pool)).unwrap();
        let cache = MemoryCommunityCache::new(vec![parsed(&a)]);

        let merged = skein.discover_communities(None, &cache).await;
        let names: Vec<_> = merged.iter().filter_map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["B", "A"]);
        assert_eq!(cache.load(), merged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_relay_list_takes_newest() {
        let relay = RelayUrl::parse("wss://lists.test").unwrap();
        let pool = MemoryRelayPool::with_relays([&relay]);
        let keys = Keys::generate();
        for (t, url) in [(1, "wss://old.test"), (2, "wss://new.test")] {
            pool.insert(
                &relay,
                keys.sign_event(UnsignedEvent::new(keys.public_key(), Timestamp(t), Kind::RELAY_LIST, "").tag(["r", url])),
            );
        }
        let config = SkeinConfig {
            default_relays: vec![relay],
            offload: false,
            ..SkeinConfig::default()
        };
        let skein = Skein::start(config, Arc::new(pool)).unwrap();

        let list = skein.fetch_relay_list(keys.public_key(), None).await.unwrap();
        assert_eq!(list.read[0].as_str(), "wss://new.test");
        assert_eq!(skein.fetch_relay_list(Keys::generate().public_key(), None).await, None);
    }
}
