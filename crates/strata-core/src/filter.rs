//! Query filters
//!
//! A [`Filter`] is a conjunction of dimensions. Within a dimension any listed
//! value matches. Empty lists are treated as absent.
//!
//! The JSON shape keys tag constraints as `"#x"`:
//!
//! ```json
//! {"kinds":[1],"#e":["5c83..."],"since":1700000000,"limit":20}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::event::{Event, EventId, PublicKey};
use crate::kind::Kind;

/// Conjunctive query over stored events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FilterWire", into = "FilterWire")]
pub struct Filter {
    pub ids: Vec<EventId>,
    pub kinds: Vec<Kind>,
    pub authors: Vec<PublicKey>,
    /// Single-letter tag name to accepted values
    pub tags: BTreeMap<char, Vec<String>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(mut self, ids: impl IntoIterator<Item = EventId>) -> Self {
        self.ids.extend(ids);
        self
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn with_authors(mut self, authors: impl IntoIterator<Item = PublicKey>) -> Self {
        self.authors.extend(authors);
        self
    }

    pub fn with_tag<I, S>(mut self, name: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(name)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn with_since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_until(mut self, until: i64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when no dimension constrains the result
    pub fn is_unconstrained(&self) -> bool {
        self.ids.is_empty()
            && self.kinds.is_empty()
            && self.authors.is_empty()
            && self.tags.is_empty()
            && self.since.is_none()
            && self.until.is_none()
    }

    /// Check every dimension against a full event
    pub fn matches(&self, event: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&event.id) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        for (name, values) in &self.tags {
            let mut buf = [0u8; 4];
            let name: &str = name.encode_utf8(&mut buf);
            if !event
                .tag_values(name)
                .any(|v| values.iter().any(|want| want == v))
            {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        true
    }

    /// Check the dimensions a demoted record can still prove
    ///
    /// A stub carries only its id, so every other dimension is assumed to
    /// hold; the index entry that produced it already matched one of them.
    pub fn matches_stub(&self, id: &EventId) -> bool {
        self.ids.is_empty() || self.ids.contains(id)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Serialize, Deserialize)]
struct FilterWire {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    ids: Vec<EventId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    kinds: Vec<Kind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    authors: Vec<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<FilterWire> for Filter {
    type Error = EventError;

    fn try_from(wire: FilterWire) -> Result<Self, Self::Error> {
        let mut tags = BTreeMap::new();
        for (key, value) in wire.extra {
            let mut chars = key.chars();
            let (Some('#'), Some(name), None) = (chars.next(), chars.next(), chars.next()) else {
                continue;
            };
            let values: Vec<String> = serde_json::from_value(value).map_err(|e| {
                EventError::InvalidFilter(format!("tag filter {key} must be a string list: {e}"))
            })?;
            tags.insert(name, values);
        }
        Ok(Filter {
            ids: wire.ids,
            kinds: wire.kinds,
            authors: wire.authors,
            tags,
            since: wire.since,
            until: wire.until,
            limit: wire.limit,
        })
    }
}

impl From<Filter> for FilterWire {
    fn from(filter: Filter) -> Self {
        let extra = filter
            .tags
            .into_iter()
            .map(|(name, values)| (format!("#{name}"), serde_json::Value::from(values)))
            .collect();
        FilterWire {
            ids: filter.ids,
            kinds: filter.kinds,
            authors: filter.authors,
            since: filter.since,
            until: filter.until,
            limit: filter.limit,
            extra,
        }
    }
}
