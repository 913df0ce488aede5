//! Relay selection (outbox model)
//!
//! Maps filters to the subset of relays worth asking, using per-author
//! write-relay advertisements. Authors sharing a relay are folded into
//! one narrowed filter per relay. The mapping preserves the order
//! relays appear in author advertisements, so unchanged inputs always
//! produce an identical mapping.

use crate::event::AuthorId;
use crate::filter::Filter;
use crate::relay::pool::RelayPool;
use crate::relay::RelayUrl;
use std::collections::BTreeSet;
use tracing::debug;

/// Point-in-time view of the authors' advertised write relays, in
/// advertisement order.
#[derive(Debug, Clone, Default)]
pub struct OutboxSnapshot {
    authors: Vec<(AuthorId, Vec<RelayUrl>)>,
}

impl OutboxSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an author's write relays, replacing any earlier entry.
    pub fn insert(&mut self, author: impl Into<AuthorId>, relays: Vec<RelayUrl>) {
        let author = author.into();
        self.authors.retain(|(existing, _)| *existing != author);
        self.authors.push((author, relays));
    }

    pub fn write_relays(&self, author: &str) -> Option<&[RelayUrl]> {
        self.authors
            .iter()
            .find(|(existing, _)| existing == author)
            .map(|(_, relays)| relays.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.authors.is_empty()
    }
}

/// Ordered relay → filters mapping produced by selection.
///
/// Backed by a vector so iteration order is exactly insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelaySetMapping {
    entries: Vec<(RelayUrl, Vec<Filter>)>,
}

impl RelaySetMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter under a relay, keeping first-insertion order.
    pub fn add(&mut self, relay: RelayUrl, filter: Filter) {
        match self.entries.iter_mut().find(|(url, _)| *url == relay) {
            Some((_, filters)) => filters.push(filter),
            None => self.entries.push((relay, vec![filter])),
        }
    }

    pub fn filters_for(&self, relay: &RelayUrl) -> Option<&[Filter]> {
        self.entries
            .iter()
            .find(|(url, _)| url == relay)
            .map(|(_, filters)| filters.as_slice())
    }

    pub fn relays(&self) -> impl Iterator<Item = &RelayUrl> {
        self.entries.iter().map(|(url, _)| url)
    }

    pub fn contains(&self, relay: &RelayUrl) -> bool {
        self.entries.iter().any(|(url, _)| url == relay)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RelayUrl, &[Filter])> {
        self.entries
            .iter()
            .map(|(url, filters)| (url, filters.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compute the relay → filters mapping for `filters`.
///
/// Filters with authors are narrowed per relay to the authors that
/// advertise it; authors with no known relay list fall back to (at
/// most `fallback_limit` of) the explicit relays. Filters without an
/// authors clause cannot be narrowed and go to every explicit relay
/// verbatim.
pub fn calculate_relay_sets(
    filters: &[Filter],
    snapshot: &OutboxSnapshot,
    explicit_relays: &[RelayUrl],
    fallback_limit: usize,
) -> RelaySetMapping {
    let mut mapping = RelaySetMapping::new();

    for filter in filters {
        let authors = match &filter.authors {
            Some(authors) if !authors.is_empty() => authors,
            _ => {
                for relay in explicit_relays {
                    mapping.add(relay.clone(), filter.clone());
                }
                continue;
            }
        };

        // relay → authors that advertise it, in advertisement order
        let mut per_relay: Vec<(RelayUrl, Vec<AuthorId>)> = Vec::new();
        let mut unknown: Vec<AuthorId> = Vec::new();
        for author in authors {
            match snapshot.write_relays(author) {
                Some(relays) if !relays.is_empty() => {
                    for relay in relays {
                        match per_relay.iter_mut().find(|(url, _)| url == relay) {
                            Some((_, listed)) => {
                                if !listed.contains(author) {
                                    listed.push(author.clone());
                                }
                            }
                            None => per_relay.push((relay.clone(), vec![author.clone()])),
                        }
                    }
                }
                _ => unknown.push(author.clone()),
            }
        }

        for (relay, relay_authors) in per_relay {
            mapping.add(relay, filter.with_authors(relay_authors));
        }

        if !unknown.is_empty() {
            debug!(
                authors = unknown.len(),
                "no relay list for some authors, using explicit relays"
            );
            let narrowed = filter.with_authors(unknown);
            for relay in explicit_relays.iter().take(fallback_limit) {
                mapping.add(relay.clone(), narrowed.clone());
            }
        }
    }

    mapping
}

/// Keep a computed relay set warm: when it shares no relay with the
/// currently-connected set, union the connected relays in; on a cold
/// start with nothing connected, union in the whole pool instead.
pub fn correct_relay_set(
    mapping: &RelaySetMapping,
    filters: &[Filter],
    pool: &RelayPool,
) -> RelaySetMapping {
    let connected: Vec<RelayUrl> = pool
        .connected_relays()
        .into_iter()
        .map(|relay| relay.url().clone())
        .collect();

    let has_connected = mapping.relays().any(|url| connected.contains(url));
    if has_connected {
        return mapping.clone();
    }

    let union_with: Vec<RelayUrl> = if connected.is_empty() {
        pool.urls()
    } else {
        connected
    };

    let mut corrected = mapping.clone();
    let extra: BTreeSet<RelayUrl> = union_with
        .into_iter()
        .filter(|url| !corrected.contains(url))
        .collect();
    for relay in extra {
        for filter in filters {
            corrected.add(relay.clone(), filter.clone());
        }
    }
    corrected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::MemoryTransport;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    fn snapshot(entries: &[(&str, &[&str])]) -> OutboxSnapshot {
        let mut snapshot = OutboxSnapshot::new();
        for (author, relays) in entries {
            snapshot.insert(
                author.to_string(),
                relays.iter().map(|r| url(r)).collect(),
            );
        }
        snapshot
    }

    #[test]
    fn test_authors_partition_across_their_write_relays() {
        let snapshot = snapshot(&[
            ("alice", &["wss://a.test", "wss://shared.test"]),
            ("bob", &["wss://shared.test", "wss://b.test"]),
        ]);
        let filter = Filter::new()
            .kinds([1])
            .with_authors(vec!["alice".to_string(), "bob".to_string()]);

        let mapping = calculate_relay_sets(&[filter], &snapshot, &[], 5);

        let a = mapping.filters_for(&url("wss://a.test")).unwrap();
        assert_eq!(a[0].authors.as_deref(), Some(&["alice".to_string()][..]));

        let shared = mapping.filters_for(&url("wss://shared.test")).unwrap();
        assert_eq!(
            shared[0].authors.as_deref(),
            Some(&["alice".to_string(), "bob".to_string()][..])
        );

        let b = mapping.filters_for(&url("wss://b.test")).unwrap();
        assert_eq!(b[0].authors.as_deref(), Some(&["bob".to_string()][..]));
        // everything else of the filter survives narrowing
        assert_eq!(b[0].kinds.as_deref(), Some(&[1u32][..]));
    }

    #[test]
    fn test_mapping_preserves_advertised_relay_order() {
        let snapshot = snapshot(&[("alice", &["wss://z.test", "wss://a.test", "wss://m.test"])]);
        let filter = Filter::new().with_authors(vec!["alice".to_string()]);

        let mapping = calculate_relay_sets(&[filter], &snapshot, &[], 5);
        let order: Vec<&RelayUrl> = mapping.relays().collect();
        assert_eq!(
            order,
            vec![&url("wss://z.test"), &url("wss://a.test"), &url("wss://m.test")]
        );
    }

    #[test]
    fn test_unknown_authors_fall_back_to_explicit_relays() {
        let snapshot = snapshot(&[("alice", &["wss://a.test"])]);
        let explicit = vec![url("wss://e1.test"), url("wss://e2.test"), url("wss://e3.test")];
        let filter = Filter::new().with_authors(vec!["alice".to_string(), "nobody".to_string()]);

        let mapping = calculate_relay_sets(&[filter], &snapshot, &explicit, 2);

        // the fallback is capped
        assert!(mapping.contains(&url("wss://e1.test")));
        assert!(mapping.contains(&url("wss://e2.test")));
        assert!(!mapping.contains(&url("wss://e3.test")));
        let fallback = mapping.filters_for(&url("wss://e1.test")).unwrap();
        assert_eq!(
            fallback[0].authors.as_deref(),
            Some(&["nobody".to_string()][..])
        );
    }

    #[test]
    fn test_authorless_filters_go_to_explicit_relays_verbatim() {
        let explicit = vec![url("wss://e1.test"), url("wss://e2.test")];
        let filter = Filter::new().kinds([7]);

        let mapping = calculate_relay_sets(&[filter.clone()], &OutboxSnapshot::new(), &explicit, 1);
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping.filters_for(&url("wss://e2.test")).unwrap()[0], filter);
    }

    fn pool_with(transport: &MemoryTransport) -> RelayPool {
        let (inbox, _rx) = mpsc::unbounded_channel();
        std::mem::forget(_rx);
        RelayPool::new(
            Arc::new(transport.clone()),
            ClientConfig::default(),
            inbox,
        )
    }

    #[tokio::test]
    async fn test_correct_relay_set_unions_connected_relays() {
        let transport = MemoryTransport::new();
        let pool = pool_with(&transport);
        pool.add_relay(&url("wss://warm.test"), true).unwrap();
        pool.connect_all(Duration::from_millis(500)).await;

        let filter = Filter::new().kinds([1]);
        let mut mapping = RelaySetMapping::new();
        mapping.add(url("wss://cold.test"), filter.clone());

        let corrected = correct_relay_set(&mapping, &[filter], &pool);
        assert!(corrected.contains(&url("wss://cold.test")));
        assert!(corrected.contains(&url("wss://warm.test")));
    }

    #[tokio::test]
    async fn test_correct_relay_set_keeps_warm_mapping_untouched() {
        let transport = MemoryTransport::new();
        let pool = pool_with(&transport);
        pool.add_relay(&url("wss://warm.test"), true).unwrap();
        pool.add_relay(&url("wss://other.test"), true).unwrap();
        pool.connect_all(Duration::from_millis(500)).await;

        let filter = Filter::new().kinds([1]);
        let mut mapping = RelaySetMapping::new();
        mapping.add(url("wss://warm.test"), filter.clone());

        let corrected = correct_relay_set(&mapping, &[filter], &pool);
        assert_eq!(corrected.len(), 1);
    }

    #[tokio::test]
    async fn test_correct_relay_set_cold_start_unions_whole_pool() {
        let transport = MemoryTransport::new();
        let pool = pool_with(&transport);
        pool.add_relay(&url("wss://one.test"), false).unwrap();
        pool.add_relay(&url("wss://two.test"), false).unwrap();

        let filter = Filter::new().kinds([1]);
        let corrected = correct_relay_set(&RelaySetMapping::new(), &[filter], &pool);
        assert!(corrected.contains(&url("wss://one.test")));
        assert!(corrected.contains(&url("wss://two.test")));
    }

    proptest! {
        #[test]
        fn prop_selection_is_deterministic(
            authors in proptest::collection::vec("[a-f]{4}", 1..6),
            relay_picks in proptest::collection::vec(0u8..4, 1..6),
        ) {
            let relay_names = ["wss://r0.test", "wss://r1.test", "wss://r2.test", "wss://r3.test"];
            let mut snapshot = OutboxSnapshot::new();
            for (i, author) in authors.iter().enumerate() {
                let relays: Vec<RelayUrl> = relay_picks
                    .iter()
                    .cycle()
                    .skip(i)
                    .take(relay_picks.len())
                    .map(|&pick| url(relay_names[pick as usize]))
                    .collect();
                snapshot.insert(author.clone(), relays);
            }
            let filter = Filter::new().with_authors(authors);
            let explicit = vec![url("wss://e.test")];

            let first = calculate_relay_sets(&[filter.clone()], &snapshot, &explicit, 5);
            let second = calculate_relay_sets(&[filter], &snapshot, &explicit, 5);
            prop_assert_eq!(first, second);
        }
    }
}
