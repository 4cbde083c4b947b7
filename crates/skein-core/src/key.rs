//! Canonical request keys
//!
//! Two requests share one underlying network subscription iff their keys
//! are equal. A key encodes the filters attribute by attribute (object keys
//! sorted lexicographically at every depth, arrays kept in order) plus the
//! normalized relay set. Keys are only meaningful within one process.

use std::fmt;
use std::fmt::Write as _;

use serde_json::Value;

use crate::{normalize_relays, Filter, RelayUrl, SkeinError, SkeinResult};

/// Deterministic, comparable request key
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// Key for a shared subscription over `filters` against `relays`.
    ///
    /// `relays` must already be normalized (see [`normalize_relays`]).
    pub fn subscription(filters: &[Filter], relays: &[RelayUrl]) -> Self {
        let mut key = String::from("sub|");
        write_filters(&mut key, filters);
        write_relays(&mut key, relays);
        CanonicalKey(key)
    }

    /// Key for a feed; the pagination limit is part of the identity.
    pub fn feed(filters: &[Filter], relays: &[RelayUrl], limit: usize) -> Self {
        let mut key = format!("feed|{}|", limit);
        write_filters(&mut key, filters);
        write_relays(&mut key, relays);
        CanonicalKey(key)
    }

    /// Key of a feed named by its owner rather than by its query. Re-using
    /// the name with another limit resizes the same feed.
    pub fn named(name: &str) -> Self {
        CanonicalKey(format!("name|{}", name))
    }

    /// Key that is never shared with another request, such as one metadata
    /// batch. `serial` must be unique per `scope` within the process.
    pub fn unique(scope: &str, serial: u64, filters: &[Filter], relays: &[RelayUrl]) -> Self {
        let mut key = format!("{}#{}|", scope, serial);
        write_filters(&mut key, filters);
        write_relays(&mut key, relays);
        CanonicalKey(key)
    }

    /// Normalize `relays` with the given fan-out cap and build the
    /// subscription key in one step. Fails for a malformed request.
    pub fn for_request(filters: &[Filter], relays: &[RelayUrl], max_width: usize) -> SkeinResult<(Self, Vec<RelayUrl>)> {
        let relays = normalize_relays(relays, max_width);
        check_request(filters, &relays)?;
        Ok((Self::subscription(filters, &relays), relays))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A request needs at least one filter and one relay
pub fn check_request(filters: &[Filter], relays: &[RelayUrl]) -> SkeinResult<()> {
    if filters.is_empty() {
        return Err(SkeinError::EmptyFilters);
    }
    if relays.is_empty() {
        return Err(SkeinError::EmptyRelays);
    }
    Ok(())
}

impl fmt::Debug for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_filters(out: &mut String, filters: &[Filter]) {
    out.push('[');
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        // Filters only hold strings, integers and collections of them;
        // conversion to a JSON value cannot fail.
        let value = serde_json::to_value(filter).unwrap_or(Value::Null);
        write_canonical(out, &value);
    }
    out.push(']');
}

fn write_relays(out: &mut String, relays: &[RelayUrl]) {
    out.push('|');
    for (i, relay) in relays.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(relay.as_str());
    }
}

/// Write a JSON value with object keys sorted at every depth
fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", Value::String(k.clone()));
                write_canonical(out, v);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{}", scalar);
        }
    }
}
