//! Relay addresses
//!
//! Relays are addressed by websocket URLs. Addresses are normalized so that
//! trivially different spellings of the same relay compare equal.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{SkeinError, SkeinResult};

/// Normalized relay address
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayUrl(String);

impl RelayUrl {
    /// Parse and normalize a relay url.
    ///
    /// Scheme and host are lowercased, surrounding whitespace and a
    /// trailing slash are removed. Only `ws://` and `wss://` are accepted.
    pub fn parse(raw: &str) -> SkeinResult<Self> {
        let trimmed = raw.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| SkeinError::InvalidRelayUrl(raw.to_string()))?;

        let scheme = scheme.to_ascii_lowercase();
        if scheme != "ws" && scheme != "wss" {
            return Err(SkeinError::InvalidRelayUrl(raw.to_string()));
        }

        let (host, path) = match rest.find('/') {
            Some(pos) => rest.split_at(pos),
            None => (rest, ""),
        };
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(SkeinError::InvalidRelayUrl(raw.to_string()));
        }

        let path = path.trim_end_matches('/');
        Ok(RelayUrl(format!(
            "{}://{}{}",
            scheme,
            host.to_ascii_lowercase(),
            path
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Relay({})", self.0)
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RelayUrl {
    type Err = SkeinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RelayUrl::parse(s)
    }
}

impl TryFrom<String> for RelayUrl {
    type Error = SkeinError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RelayUrl::parse(&value)
    }
}

impl From<RelayUrl> for String {
    fn from(url: RelayUrl) -> Self {
        url.0
    }
}

/// Deduplicate and sort a relay set, then cap it at `max_width` entries.
///
/// The result is order independent so the relays actually queried always
/// agree with the canonical key.
pub fn normalize_relays<'a, I>(relays: I, max_width: usize) -> Vec<RelayUrl>
where
    I: IntoIterator<Item = &'a RelayUrl>,
{
    relays
        .into_iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .take(max_width)
        .collect()
}
