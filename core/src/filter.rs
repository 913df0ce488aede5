//! Subscription filters and event admission
//!
//! A filter is the wire-level query shape: fixed fields plus a map of
//! single-letter tag clauses (`#e`, `#p`, `#t`, ...). Matching follows
//! the admission rule: ids/kinds/authors are exact matches, `since` is
//! an inclusive lower bound, `until` an exclusive upper bound, and tag
//! clauses intersect the event's tag values — case-folded only for `t`.

use crate::event::Event;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A single query filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Exact event IDs
    pub ids: Option<Vec<String>>,
    /// Event kinds
    pub kinds: Option<Vec<u32>>,
    /// Author public keys
    pub authors: Option<Vec<String>>,
    /// Inclusive lower bound on `created_at`
    pub since: Option<u64>,
    /// Exclusive upper bound on `created_at`
    pub until: Option<u64>,
    /// Maximum number of stored events the relay should return
    pub limit: Option<u64>,
    /// Free-text search, interpreted relay-side
    pub search: Option<String>,
    /// Tag clauses keyed by single-letter tag name
    pub tags: BTreeMap<char, BTreeSet<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds<I: IntoIterator<Item = u32>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors<I: IntoIterator<Item = S>, S: Into<String>>(mut self, authors: I) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Add a `#<letter>` tag clause value.
    pub fn tag<S: Into<String>>(mut self, letter: char, value: S) -> Self {
        self.tags.entry(letter).or_default().insert(value.into());
        self
    }

    /// Replace the author list, keeping everything else.
    pub fn with_authors(&self, authors: Vec<String>) -> Self {
        let mut filter = self.clone();
        filter.authors = Some(authors);
        filter
    }

    /// Whether `event` satisfies every clause of this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| *id == event.id) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|author| *author == event.pubkey) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at >= until {
                return false;
            }
        }
        for (letter, wanted) in &self.tags {
            if !self.tag_clause_matches(*letter, wanted, event) {
                return false;
            }
        }
        true
    }

    fn tag_clause_matches(&self, letter: char, wanted: &BTreeSet<String>, event: &Event) -> bool {
        let name = letter.to_string();
        // only `t` tags are case-folded
        if letter == 't' {
            event
                .tag_values(&name)
                .any(|value| wanted.iter().any(|w| w.eq_ignore_ascii_case(value)))
        } else {
            event.tag_values(&name).any(|value| wanted.contains(value))
        }
    }

    /// Deterministic serialized form, usable as a grouping key.
    pub fn canonical(&self) -> String {
        // Serialize writes fields in declaration order and tag letters
        // in BTreeMap order, so equal filters produce equal strings.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        if let Some(search) = &self.search {
            map.serialize_entry("search", search)?;
        }
        for (letter, values) in &self.tags {
            map.serialize_entry(&format!("#{letter}"), values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FilterVisitor;

        impl<'de> Visitor<'de> for FilterVisitor {
            type Value = Filter;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a filter object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Filter, A::Error> {
                let mut filter = Filter::default();
                while let Some(key) = access.next_key::<String>()? {
                    match key.as_str() {
                        "ids" => filter.ids = Some(access.next_value()?),
                        "kinds" => filter.kinds = Some(access.next_value()?),
                        "authors" => filter.authors = Some(access.next_value()?),
                        "since" => filter.since = Some(access.next_value()?),
                        "until" => filter.until = Some(access.next_value()?),
                        "limit" => filter.limit = Some(access.next_value()?),
                        "search" => filter.search = Some(access.next_value()?),
                        other => {
                            let mut chars = other.chars();
                            match (chars.next(), chars.next(), chars.next()) {
                                (Some('#'), Some(letter), None) => {
                                    let values: BTreeSet<String> = access.next_value()?;
                                    filter.tags.insert(letter, values);
                                }
                                _ => {
                                    return Err(de::Error::unknown_field(
                                        other,
                                        &["ids", "kinds", "authors", "since", "until", "limit", "search", "#<letter>"],
                                    ));
                                }
                            }
                        }
                    }
                }
                Ok(filter)
            }
        }

        deserializer.deserialize_map(FilterVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with(kind: u32, pubkey: &str, created_at: u64, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: "event-id".into(),
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn test_exact_match_clauses() {
        let filter = Filter::new().kinds([1]).authors(["alice"]);
        assert!(filter.matches(&event_with(1, "alice", 10, vec![])));
        assert!(!filter.matches(&event_with(2, "alice", 10, vec![])));
        assert!(!filter.matches(&event_with(1, "bob", 10, vec![])));
    }

    #[test]
    fn test_since_inclusive_until_exclusive() {
        let filter = Filter::new().since(100).until(200);
        assert!(!filter.matches(&event_with(1, "a", 99, vec![])));
        assert!(filter.matches(&event_with(1, "a", 100, vec![])));
        assert!(filter.matches(&event_with(1, "a", 199, vec![])));
        assert!(!filter.matches(&event_with(1, "a", 200, vec![])));
    }

    #[test]
    fn test_t_tag_case_insensitive() {
        let filter = Filter::new().tag('t', "Rust");
        let event = event_with(1, "a", 10, vec![vec!["t".into(), "rUSt".into()]]);
        assert!(filter.matches(&event));
    }

    #[test]
    fn test_other_tags_case_sensitive() {
        let filter = Filter::new().tag('p', "Alice");
        let lower = event_with(1, "a", 10, vec![vec!["p".into(), "alice".into()]]);
        let exact = event_with(1, "a", 10, vec![vec!["p".into(), "Alice".into()]]);
        assert!(!filter.matches(&lower));
        assert!(filter.matches(&exact));
    }

    #[test]
    fn test_tag_clause_set_intersection() {
        let filter = Filter::new().tag('e', "id-a").tag('e', "id-b");
        let event = event_with(1, "a", 10, vec![vec!["e".into(), "id-b".into()]]);
        assert!(filter.matches(&event));

        let miss = event_with(1, "a", 10, vec![vec!["e".into(), "id-c".into()]]);
        assert!(!filter.matches(&miss));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = Filter::new();
        assert!(filter.matches(&event_with(42, "anyone", 0, vec![])));
    }

    #[test]
    fn test_serde_tag_keys() {
        let filter = Filter::new().kinds([1]).tag('t', "topic").tag('p', "peer");
        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains(r##""#t":["topic"]"##));
        assert!(json.contains(r##""#p":["peer"]"##));

        let back: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(filter, back);
    }

    #[test]
    fn test_deserialize_rejects_multi_letter_tag_key() {
        let err = serde_json::from_str::<Filter>(r##"{"#tag":["x"]}"##);
        assert!(err.is_err());
    }

    #[test]
    fn test_canonical_is_stable() {
        let a = Filter::new().kinds([1, 2]).authors(["x"]).tag('t', "y");
        let b = Filter::new().kinds([1, 2]).authors(["x"]).tag('t', "y");
        assert_eq!(a.canonical(), b.canonical());
    }
}
