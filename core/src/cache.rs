//! Cache adapter seam
//!
//! A cache answers filters from local storage before (or instead of)
//! the network, depending on the subscription's cache policy. Cached
//! answers feed the same routing path as relay deliveries, so the
//! seen-events ledger dedups overlap between the two.

use crate::event::{Event, EventId};
use crate::filter::Filter;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Local event storage consulted by subscriptions.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// Events matching any of `filters`, newest first.
    async fn query(&self, filters: &[Filter]) -> Vec<Event>;

    /// Record an event for future queries.
    async fn store(&self, event: &Event);
}

/// Unbounded in-memory cache.
#[derive(Default)]
pub struct MemoryCache {
    events: Mutex<HashMap<EventId, Event>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    async fn query(&self, filters: &[Filter]) -> Vec<Event> {
        let events = self.events.lock();
        let mut matched: Vec<Event> = events
            .values()
            .filter(|event| filters.iter().any(|f| f.matches(event)))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched
    }

    async fn store(&self, event: &Event) {
        self.events.lock().insert(event.id.clone(), event.clone());
    }
}
