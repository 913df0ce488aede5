//! Subscriptions — logical queries over the relay set
//!
//! A subscription is one client query: filters plus options. The
//! manager groups compatible subscriptions into shared wire queries,
//! dedups deliveries across relays, and fans events out to matching
//! subscriptions.

pub mod manager;

pub use manager::SubscriptionManager;

use crate::event::{Event, EventId};
use crate::relay::RelayUrl;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;

/// Subscription lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Created, not yet sent to any relay
    Pending,
    /// REQ sent to at least one relay
    Running,
    /// Every targeted relay signaled end-of-stored-events
    Eosed,
    Closed,
}

/// How a subscription uses the cache adapter relative to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheUsage {
    /// Answer from cache only; never touch the network
    CacheOnly,
    /// Query the cache first, then the network
    CacheFirst,
    /// Query cache and network concurrently
    #[default]
    Parallel,
    /// Skip the cache entirely
    RelayOnly,
}

/// Per-subscription options.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Hold the subscribe briefly so identical queries share one REQ
    pub groupable: bool,
    /// Override the configured grouping delay
    pub groupable_delay: Option<Duration>,
    /// Close automatically once stored events are exhausted
    pub close_on_eose: bool,
    pub cache_usage: CacheUsage,
    /// Explicit relay targets; empty means calculated selection
    pub relay_urls: Vec<RelayUrl>,
    /// Discard events from relays outside `relay_urls`
    pub exclusive_relay: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            groupable: true,
            groupable_delay: None,
            close_on_eose: false,
            cache_usage: CacheUsage::default(),
            relay_urls: Vec::new(),
            exclusive_relay: false,
        }
    }
}

/// What a subscription's consumer receives.
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate {
    Event {
        event: Event,
        /// None for cache-served events
        relay: Option<RelayUrl>,
    },
    Eose,
    Closed {
        message: String,
    },
}

/// Caller's end of a subscription.
pub struct SubscriptionHandle {
    id: String,
    updates: mpsc::UnboundedReceiver<SubscriptionUpdate>,
    manager: SubscriptionManager,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        id: String,
        updates: mpsc::UnboundedReceiver<SubscriptionUpdate>,
        manager: SubscriptionManager,
    ) -> Self {
        Self {
            id,
            updates,
            manager,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.manager.state_of(&self.id)
    }

    /// Next update, or `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<SubscriptionUpdate> {
        self.updates.recv().await
    }

    /// Stop the subscription. Immediate and idempotent.
    pub fn stop(&self) {
        self.manager.stop(&self.id);
    }
}

struct SeenEntry {
    relays: Vec<RelayUrl>,
    last_touched: u64,
}

/// Which relays delivered which event, first-seen order, LRU-capped.
///
/// A hint structure, not a log: entries may be evicted under pressure,
/// so absence proves nothing. A relay appears at most once per event
/// no matter how often it redelivers.
pub struct SeenLedger {
    capacity: usize,
    entries: HashMap<EventId, SeenEntry>,
    /// (event id, touch stamp) pairs; stale stamps are skipped lazily
    order: VecDeque<(EventId, u64)>,
    clock: u64,
}

impl SeenLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            clock: 0,
        }
    }

    /// Record that `relay` delivered `event_id`. Returns false when
    /// that relay was already on the event's delivery list.
    pub fn note(&mut self, event_id: &str, relay: &RelayUrl) -> bool {
        self.clock += 1;
        let stamp = self.clock;
        let newly_added = match self.entries.get_mut(event_id) {
            Some(entry) => {
                entry.last_touched = stamp;
                if entry.relays.contains(relay) {
                    false
                } else {
                    entry.relays.push(relay.clone());
                    true
                }
            }
            None => {
                self.entries.insert(
                    event_id.to_string(),
                    SeenEntry {
                        relays: vec![relay.clone()],
                        last_touched: stamp,
                    },
                );
                true
            }
        };
        self.order.push_back((event_id.to_string(), stamp));
        self.evict();
        newly_added
    }

    pub fn relays_for(&self, event_id: &str) -> Option<&[RelayUrl]> {
        self.entries
            .get(event_id)
            .map(|entry| entry.relays.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some((event_id, stamp)) => {
                    // only a current stamp evicts; stale ones are
                    // leftovers from later touches of the same id
                    let current = self
                        .entries
                        .get(&event_id)
                        .map(|entry| entry.last_touched == stamp)
                        .unwrap_or(false);
                    if current {
                        self.entries.remove(&event_id);
                    }
                }
                None => break,
            }
        }
        // redeliveries of a few hot ids leave stale stamps behind;
        // compact before the deque outgrows the entry map
        if self.order.len() > self.capacity * 2 {
            let entries = &self.entries;
            self.order.retain(|(event_id, stamp)| {
                entries
                    .get(event_id)
                    .map(|entry| entry.last_touched == *stamp)
                    .unwrap_or(false)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    #[test]
    fn test_ledger_has_set_semantics_per_event() {
        let mut ledger = SeenLedger::new(100);
        assert!(ledger.note("e1", &url("wss://a.test")));
        assert!(ledger.note("e1", &url("wss://b.test")));
        assert!(!ledger.note("e1", &url("wss://a.test")));

        // first-seen order, one entry per relay
        assert_eq!(
            ledger.relays_for("e1").unwrap(),
            &[url("wss://a.test"), url("wss://b.test")]
        );
    }

    #[test]
    fn test_ledger_evicts_least_recently_touched() {
        let mut ledger = SeenLedger::new(2);
        let relay = url("wss://a.test");
        ledger.note("e1", &relay);
        ledger.note("e2", &relay);
        // touch e1 so e2 is the LRU entry
        ledger.note("e1", &relay);
        ledger.note("e3", &relay);

        assert_eq!(ledger.len(), 2);
        assert!(ledger.relays_for("e1").is_some());
        assert!(ledger.relays_for("e2").is_none());
        assert!(ledger.relays_for("e3").is_some());
    }

    #[test]
    fn test_ledger_never_exceeds_capacity() {
        let mut ledger = SeenLedger::new(8);
        let relay = url("wss://a.test");
        for i in 0..100 {
            ledger.note(&format!("e{i}"), &relay);
            assert!(ledger.len() <= 8);
        }
    }

    #[test]
    fn test_ledger_redelivery_keeps_order_deque_bounded() {
        let mut ledger = SeenLedger::new(64);
        let relays = [url("wss://a.test"), url("wss://b.test")];
        // a handful of hot ids redelivered forever must not grow the
        // touch deque past the compaction threshold
        for round in 0..80_000usize {
            ledger.note(&format!("e{}", round % 8), &relays[round % 2]);
        }
        assert_eq!(ledger.len(), 8);
        assert!(ledger.order.len() <= 64 * 2);
    }
}
