//! Event definitions
//!
//! Events are immutable, author-signed records served by relays. Identity is
//! the SHA-256 of the canonical array `[0, pubkey, created_at, kind, tags,
//! content]`; the signature covers the id.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{EventId, PublicKey, Signature, Timestamp};

/// Event kind identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(pub u16);

impl Kind {
    pub const METADATA: Kind = Kind(0);
    pub const TEXT_NOTE: Kind = Kind(1);
    pub const DELETION: Kind = Kind(5);
    pub const REACTION: Kind = Kind(7);
    pub const RELAY_LIST: Kind = Kind(10002);
    pub const COMMUNITY: Kind = Kind(34550);

    #[inline]
    pub fn new(kind: u16) -> Self {
        Kind(kind)
    }

    #[inline]
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Replaceable kinds keep only the newest event per author
    pub fn is_replaceable(self) -> bool {
        self.0 == 0 || self.0 == 3 || (10_000..20_000).contains(&self.0)
    }

    /// Addressable kinds keep only the newest event per (author, d-tag)
    pub fn is_addressable(self) -> bool {
        (30_000..40_000).contains(&self.0)
    }
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kind({})", self.0)
    }
}

/// A tag is a non-empty list of strings; the first element names it
pub type Tag = Vec<String>;

/// Event content before id computation and signing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(pubkey: PublicKey, created_at: Timestamp, kind: Kind, content: impl Into<String>) -> Self {
        UnsignedEvent {
            pubkey,
            created_at,
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Add a tag
    pub fn tag<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(parts.into_iter().map(Into::into).collect());
        self
    }

    /// Compute the event id
    pub fn id(&self) -> EventId {
        compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// Attach an id and signature produced elsewhere
    pub fn into_event(self, id: EventId, sig: Signature) -> Event {
        Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

/// A signed event as served by relays
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: Signature,
}

impl Event {
    /// Recompute the id from the event body
    pub fn compute_id(&self) -> EventId {
        compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// Does the carried id match the body?
    pub fn has_valid_id(&self) -> bool {
        self.compute_id() == self.id
    }

    /// Values (second element) of every tag named `name`
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }

    /// First value of the tag named `name`
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|t| match t.as_slice() {
            [tag, value, ..] if tag == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// The `d` tag of addressable events
    pub fn identifier(&self) -> Option<&str> {
        self.first_tag_value("d")
    }

    /// Feed ordering: newest first, id ascending as the tiebreak
    pub fn feed_order(a: &Event, b: &Event) -> Ordering {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    }
}

fn compute_id(
    pubkey: &PublicKey,
    created_at: Timestamp,
    kind: Kind,
    tags: &[Tag],
    content: &str,
) -> EventId {
    let canonical = serde_json::json!([0, pubkey.to_hex(), created_at.as_secs(), kind.as_u16(), tags, content]);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hash);
    EventId::from_bytes(bytes)
}
