//! Outbox tracker
//!
//! Reference-counted cache of each author's advertised write relays.
//! The first `track` of an author schedules a relay-list fetch;
//! concurrent tracks of the same author coalesce onto that one fetch
//! through the dispatch queue. Entries are never evicted while
//! referenced; zero-refcount eviction is a housekeeping call, not a
//! correctness requirement.

use crate::dispatch::DispatchQueue;
use crate::event::AuthorId;
use crate::relay::sets::OutboxSnapshot;
use crate::relay::RelayUrl;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// Relay list lookup error types
#[derive(Debug, Clone, Error)]
pub enum OutboxError {
    #[error("Relay list fetch failed: {0}")]
    Fetch(String),
}

/// An author's advertised relay lists. Unmarked advertisements land
/// in both lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayList {
    pub write: Vec<RelayUrl>,
    pub read: Vec<RelayUrl>,
}

/// Where author relay lists come from — typically a dedicated query
/// against the network, seeded with any relay hints already known.
#[async_trait]
pub trait RelayListSource: Send + Sync {
    async fn fetch_relay_list(
        &self,
        author: &str,
        hints: &[RelayUrl],
    ) -> Result<RelayList, OutboxError>;
}

/// Fixed in-memory relay lists, for tests and static deployments.
#[derive(Default)]
pub struct StaticRelayListSource {
    lists: Mutex<HashMap<AuthorId, RelayList>>,
}

impl StaticRelayListSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an author's write relays.
    pub fn set(&self, author: impl Into<AuthorId>, relays: Vec<RelayUrl>) {
        self.set_lists(
            author,
            RelayList {
                write: relays,
                read: Vec::new(),
            },
        );
    }

    pub fn set_lists(&self, author: impl Into<AuthorId>, lists: RelayList) {
        self.lists.lock().insert(author.into(), lists);
    }
}

#[async_trait]
impl RelayListSource for StaticRelayListSource {
    async fn fetch_relay_list(
        &self,
        author: &str,
        _hints: &[RelayUrl],
    ) -> Result<RelayList, OutboxError> {
        Ok(self.lists.lock().get(author).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
struct OutboxEntry {
    ref_count: usize,
    relays: Option<RelayList>,
    fetched_at: Option<Instant>,
}

/// Tracks which authors are currently interesting and keeps their
/// write-relay lists warm.
pub struct OutboxTracker {
    source: Arc<dyn RelayListSource>,
    entries: Arc<Mutex<BTreeMap<AuthorId, OutboxEntry>>>,
    queue: DispatchQueue<AuthorId, RelayList>,
}

impl OutboxTracker {
    pub fn new(source: Arc<dyn RelayListSource>, max_concurrency: usize) -> Self {
        Self {
            source,
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            queue: DispatchQueue::new(max_concurrency),
        }
    }

    /// Add a reference to `author`. The first reference schedules a
    /// relay-list fetch; `hints` help the source reach the author's
    /// list faster.
    pub fn track(&self, author: &str, hints: &[RelayUrl]) {
        let needs_fetch = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(author.to_string()).or_default();
            entry.ref_count += 1;
            entry.ref_count == 1 && entry.relays.is_none()
        };
        if needs_fetch {
            self.schedule_fetch(author, hints);
        }
    }

    /// Drop a reference; the count never goes below zero and the
    /// entry's data stays until `evict_unreferenced`.
    pub fn untrack(&self, author: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(author) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    /// Drop entries nobody references anymore.
    pub fn evict_unreferenced(&self) {
        self.entries.lock().retain(|_, entry| entry.ref_count > 0);
    }

    pub fn write_relays(&self, author: &str) -> Option<Vec<RelayUrl>> {
        self.entries
            .lock()
            .get(author)
            .and_then(|entry| entry.relays.as_ref().map(|lists| lists.write.clone()))
    }

    pub fn read_relays(&self, author: &str) -> Option<Vec<RelayUrl>> {
        self.entries
            .lock()
            .get(author)
            .and_then(|entry| entry.relays.as_ref().map(|lists| lists.read.clone()))
    }

    /// When the author's lists were last resolved.
    pub fn fetched_at(&self, author: &str) -> Option<Instant> {
        self.entries.lock().get(author).and_then(|entry| entry.fetched_at)
    }

    pub fn ref_count(&self, author: &str) -> usize {
        self.entries
            .lock()
            .get(author)
            .map(|entry| entry.ref_count)
            .unwrap_or(0)
    }

    /// Snapshot of every resolved relay list, for the set calculator.
    pub fn snapshot(&self) -> OutboxSnapshot {
        let entries = self.entries.lock();
        let mut snapshot = OutboxSnapshot::new();
        for (author, entry) in entries.iter() {
            if let Some(lists) = &entry.relays {
                snapshot.insert(author.clone(), lists.write.clone());
            }
        }
        snapshot
    }

    fn schedule_fetch(&self, author: &str, hints: &[RelayUrl]) {
        let source = Arc::clone(&self.source);
        let fetch_author = author.to_string();
        let hints = hints.to_vec();
        let receiver = self.queue.add(author.to_string(), async move {
            source
                .fetch_relay_list(&fetch_author, &hints)
                .await
                .map_err(|e| e.to_string())
        });

        let entries = Arc::clone(&self.entries);
        let author = author.to_string();
        tokio::spawn(async move {
            match receiver.await {
                Ok(Ok(lists)) => {
                    debug!(
                        author = %author,
                        write = lists.write.len(),
                        read = lists.read.len(),
                        "relay list resolved"
                    );
                    if let Some(entry) = entries.lock().get_mut(&author) {
                        entry.relays = Some(lists);
                        entry.fetched_at = Some(Instant::now());
                    }
                }
                Ok(Err(error)) => {
                    debug!(author = %author, error = %error, "relay list fetch failed");
                }
                Err(_) => {}
            }
        });
    }
}
