//! Query filters
//!
//! A filter is a value describing which events a consumer wants: by id,
//! author, kind, referenced tag values, time bounds and free text. Filters
//! are never mutated after submission; the canonical key builder compares
//! them structurally.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Event, EventId, Kind, PublicKey, Timestamp};

/// Event query filter
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<EventId>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<PublicKey>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<Kind>>,

    /// Single-letter tag constraints, keyed `#<letter>`
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<Timestamp>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = EventId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = PublicKey>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn kind(self, kind: Kind) -> Self {
        self.kinds([kind])
    }

    /// Constrain a single-letter tag (`#e`, `#p`, ...)
    pub fn tag<I, S>(mut self, letter: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .insert(format!("#{}", letter), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    /// Does this event satisfy every constraint? `limit` is a relay-side
    /// result cap and is not checked here.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        for (key, values) in &self.tags {
            let Some(letter) = key.strip_prefix('#') else {
                continue;
            };
            let hit = event
                .tag_values(letter)
                .any(|value| values.iter().any(|v| v == value));
            if !hit {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            if !event.content.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}
