//! Subscription manager
//!
//! Owns the subscription registry, the seen-events ledger, and the
//! inbox every relay feeds inbound frames into. Routing is
//! registry-wide: an inbound event is offered to every registered
//! subscription, so overlapping queries share deliveries without
//! duplicate wire traffic.

use crate::cache::CacheAdapter;
use crate::config::ClientConfig;
use crate::event::{AuthorId, Event, EventId};
use crate::filter::Filter;
use crate::outbox::OutboxTracker;
use crate::relay::connectivity::InboundFrame;
use crate::relay::pool::RelayPool;
use crate::relay::sets::{calculate_relay_sets, correct_relay_set, RelaySetMapping};
use crate::relay::RelayUrl;
use crate::subscription::{
    CacheUsage, SeenLedger, SubscriptionHandle, SubscriptionOptions, SubscriptionState,
    SubscriptionUpdate,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

struct SubscriptionEntry {
    filters: Vec<Filter>,
    options: SubscriptionOptions,
    state: SubscriptionState,
    delivered: HashSet<EventId>,
    sender: mpsc::UnboundedSender<SubscriptionUpdate>,
    tracked_authors: Vec<AuthorId>,
    wire_id: Option<String>,
}

struct WireState {
    members: Vec<String>,
    /// Relays still serving this wire query
    serving: HashSet<RelayUrl>,
    /// Relays that have not yet signaled end-of-stored-events
    awaiting_eose: HashSet<RelayUrl>,
    settle_timer_started: bool,
    eosed: bool,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    /// Canonical filter serialization; grouping requires exact equality
    filters: String,
    relays: Vec<RelayUrl>,
    cache_usage: CacheUsage,
}

struct ManagerState {
    subscriptions: HashMap<String, SubscriptionEntry>,
    wires: HashMap<String, WireState>,
    pending_groups: HashMap<GroupKey, Vec<String>>,
    seen: SeenLedger,
}

struct ManagerInner {
    pool: Arc<RelayPool>,
    outbox: Arc<OutboxTracker>,
    cache: Option<Arc<dyn CacheAdapter>>,
    config: ClientConfig,
    state: Mutex<ManagerState>,
}

/// Shared handle to the manager. Clones share all state.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(
        pool: Arc<RelayPool>,
        outbox: Arc<OutboxTracker>,
        cache: Option<Arc<dyn CacheAdapter>>,
        config: ClientConfig,
    ) -> Self {
        let seen = SeenLedger::new(config.seen_events_capacity);
        Self {
            inner: Arc::new(ManagerInner {
                pool,
                outbox,
                cache,
                config,
                state: Mutex::new(ManagerState {
                    subscriptions: HashMap::new(),
                    wires: HashMap::new(),
                    pending_groups: HashMap::new(),
                    seen,
                }),
            }),
        }
    }

    /// Consume inbound frames from the pool's relays. Call once.
    pub fn start(&self, mut inbox: mpsc::UnboundedReceiver<InboundFrame>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbox.recv().await {
                match frame {
                    InboundFrame::Event {
                        relay,
                        subscription_id: _,
                        event,
                    } => manager.route_event(event, Some(relay)),
                    InboundFrame::Eose {
                        relay,
                        subscription_id,
                    } => manager.handle_eose(&subscription_id, &relay),
                    InboundFrame::Closed {
                        relay,
                        subscription_id,
                        message,
                    } => manager.handle_closed(&subscription_id, &relay, message),
                }
            }
        });
    }

    /// Register a subscription and (per its cache policy) start the
    /// cache query and the network query.
    pub fn subscribe(
        &self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> SubscriptionHandle {
        let id = Uuid::new_v4().to_string();
        let (sender, updates) = mpsc::unbounded_channel();

        let mut tracked_authors = Vec::new();
        for filter in &filters {
            if let Some(authors) = &filter.authors {
                for author in authors {
                    self.inner.outbox.track(author, &[]);
                    tracked_authors.push(author.clone());
                }
            }
        }

        {
            let mut state = self.inner.state.lock();
            state.subscriptions.insert(
                id.clone(),
                SubscriptionEntry {
                    filters: filters.clone(),
                    options: options.clone(),
                    state: SubscriptionState::Pending,
                    delivered: HashSet::new(),
                    sender,
                    tracked_authors,
                    wire_id: None,
                },
            );
        }
        debug!(subscription = %id, filters = filters.len(), "subscription registered");

        match options.cache_usage {
            CacheUsage::CacheOnly => {
                let manager = self.clone();
                let cache_id = id.clone();
                tokio::spawn(async move {
                    manager.run_cache_query(&cache_id, &filters).await;
                    manager.finish_cache_only(&cache_id);
                });
            }
            CacheUsage::CacheFirst => {
                let manager = self.clone();
                let cache_id = id.clone();
                tokio::spawn(async move {
                    manager.run_cache_query(&cache_id, &filters).await;
                    manager.schedule_network(&cache_id);
                });
            }
            CacheUsage::Parallel => {
                let manager = self.clone();
                let cache_id = id.clone();
                tokio::spawn(async move {
                    manager.run_cache_query(&cache_id, &filters).await;
                });
                self.schedule_network(&id);
            }
            CacheUsage::RelayOnly => self.schedule_network(&id),
        }

        SubscriptionHandle::new(id, updates, self.clone())
    }

    /// Stop a subscription. Immediate and idempotent; the last member
    /// of a wire query also closes it on every serving relay.
    pub fn stop(&self, id: &str) {
        let mut closers = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.subscriptions.remove(id) {
                self.retire_entry(&mut state, id, entry, "stopped", &mut closers);
            }
        }
        self.run_wire_closers(closers);
    }

    pub fn state_of(&self, id: &str) -> SubscriptionState {
        self.inner
            .state
            .lock()
            .subscriptions
            .get(id)
            .map(|entry| entry.state)
            .unwrap_or(SubscriptionState::Closed)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Relays known to have delivered `event_id`, first-seen order.
    ///
    /// Surfaced for callers ranking relays by delivery behavior; the
    /// routing path itself only consults the ledger for attribution.
    /// The ledger is capped, so an empty answer proves nothing.
    pub fn seen_on(&self, event_id: &str) -> Vec<RelayUrl> {
        self.inner
            .state
            .lock()
            .seen
            .relays_for(event_id)
            .map(|relays| relays.to_vec())
            .unwrap_or_default()
    }

    // Routing

    fn route_event(&self, event: Event, relay: Option<RelayUrl>) {
        {
            let mut state = self.inner.state.lock();
            if let Some(relay) = &relay {
                state.seen.note(&event.id, relay);
            }
            for entry in state.subscriptions.values_mut() {
                if entry.state == SubscriptionState::Closed {
                    continue;
                }
                if entry.options.exclusive_relay {
                    if let Some(relay) = &relay {
                        if !entry.options.relay_urls.contains(relay) {
                            continue;
                        }
                    }
                }
                if entry.delivered.contains(&event.id) {
                    continue;
                }
                if !entry.filters.iter().any(|filter| filter.matches(&event)) {
                    continue;
                }
                entry.delivered.insert(event.id.clone());
                let _ = entry.sender.send(SubscriptionUpdate::Event {
                    event: event.clone(),
                    relay: relay.clone(),
                });
            }
        }

        if relay.is_some() {
            if let Some(cache) = self.inner.cache.clone() {
                tokio::spawn(async move { cache.store(&event).await });
            }
        }
    }

    fn handle_eose(&self, wire_id: &str, relay: &RelayUrl) {
        let start_timer = {
            let mut state = self.inner.state.lock();
            let Some(wire) = state.wires.get_mut(wire_id) else {
                return;
            };
            if wire.eosed {
                return;
            }
            wire.awaiting_eose.remove(relay);
            if wire.awaiting_eose.is_empty() {
                drop(state);
                self.finalize_eose(wire_id);
                return;
            }
            if wire.settle_timer_started {
                false
            } else {
                wire.settle_timer_started = true;
                true
            }
        };

        // stragglers get a grace period after the first EOSE, then
        // the subscription goes live regardless
        if start_timer {
            let manager = self.clone();
            let wire_id = wire_id.to_string();
            let settle = self.inner.config.eose_settle_delay;
            tokio::spawn(async move {
                tokio::time::sleep(settle).await;
                manager.finalize_eose(&wire_id);
            });
        }
    }

    fn finalize_eose(&self, wire_id: &str) {
        let mut closers = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(wire) = state.wires.get_mut(wire_id) else {
                return;
            };
            if wire.eosed {
                return;
            }
            wire.eosed = true;
            let members = wire.members.clone();

            for member in members {
                let Some(entry) = state.subscriptions.get_mut(&member) else {
                    continue;
                };
                if entry.state != SubscriptionState::Running {
                    continue;
                }
                entry.state = SubscriptionState::Eosed;
                let _ = entry.sender.send(SubscriptionUpdate::Eose);
                if entry.options.close_on_eose {
                    if let Some(entry) = state.subscriptions.remove(&member) {
                        self.retire_entry(
                            &mut state,
                            &member,
                            entry,
                            "end of stored events",
                            &mut closers,
                        );
                    }
                }
            }
        }
        self.run_wire_closers(closers);
    }

    fn handle_closed(&self, wire_id: &str, relay: &RelayUrl, message: String) {
        warn!(wire = %wire_id, relay = %relay, %message, "relay closed wire subscription");
        let mut closers = Vec::new();
        let mut finalize = false;
        {
            let mut state = self.inner.state.lock();
            let Some(wire) = state.wires.get_mut(wire_id) else {
                return;
            };
            let was_serving = wire.serving.remove(relay);
            wire.awaiting_eose.remove(relay);

            if was_serving && wire.serving.is_empty() {
                // no relay left serving this wire query
                let members = wire.members.clone();
                state.wires.remove(wire_id);
                for member in members {
                    if let Some(entry) = state.subscriptions.remove(&member) {
                        self.retire_entry(&mut state, &member, entry, &message, &mut closers);
                    }
                }
            } else if !wire.eosed && wire.awaiting_eose.is_empty() {
                finalize = true;
            }
        }
        if finalize {
            self.finalize_eose(wire_id);
        }
        self.run_wire_closers(closers);
    }

    // Activation

    fn schedule_network(&self, id: &str) {
        let (filters, options) = {
            let state = self.inner.state.lock();
            match state.subscriptions.get(id) {
                Some(entry) if entry.state == SubscriptionState::Pending => {
                    (entry.filters.clone(), entry.options.clone())
                }
                _ => return,
            }
        };

        if !options.groupable {
            self.activate(vec![id.to_string()], &filters, &options);
            return;
        }

        let mut relays = options.relay_urls.clone();
        relays.sort();
        let key = GroupKey {
            filters: filters.iter().map(|f| f.canonical()).collect::<Vec<_>>().join("|"),
            relays,
            cache_usage: options.cache_usage,
        };

        let is_new_group = {
            let mut state = self.inner.state.lock();
            let members = state.pending_groups.entry(key.clone()).or_default();
            members.push(id.to_string());
            members.len() == 1
        };

        if is_new_group {
            let manager = self.clone();
            let delay = options
                .groupable_delay
                .unwrap_or(manager.inner.config.groupable_delay);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let members = manager
                    .inner
                    .state
                    .lock()
                    .pending_groups
                    .remove(&key)
                    .unwrap_or_default();
                if !members.is_empty() {
                    manager.activate(members, &filters, &options);
                }
            });
        }
    }

    fn activate(&self, member_ids: Vec<String>, filters: &[Filter], options: &SubscriptionOptions) {
        let mapping = self.select_relays(filters, options);
        let wire_id = format!("q{}", &Uuid::new_v4().simple().to_string()[..12]);

        let live_members: Vec<String> = {
            let mut state = self.inner.state.lock();
            let live: Vec<String> = member_ids
                .into_iter()
                .filter(|id| state.subscriptions.contains_key(id))
                .collect();
            if live.is_empty() {
                return;
            }
            let relays: HashSet<RelayUrl> = mapping.relays().cloned().collect();
            state.wires.insert(
                wire_id.clone(),
                WireState {
                    members: live.clone(),
                    serving: relays.clone(),
                    awaiting_eose: relays,
                    settle_timer_started: false,
                    eosed: false,
                },
            );
            for member in &live {
                if let Some(entry) = state.subscriptions.get_mut(member) {
                    entry.state = SubscriptionState::Running;
                    entry.wire_id = Some(wire_id.clone());
                }
            }
            live
        };
        debug!(
            wire = %wire_id,
            members = live_members.len(),
            relays = mapping.len(),
            "wire subscription opened"
        );

        if mapping.is_empty() {
            // nowhere to ask; there are no stored events to wait for
            self.finalize_eose(&wire_id);
            return;
        }

        let connect_timeout = self.inner.config.connect_timeout;
        for (url, relay_filters) in mapping.iter() {
            let Some(relay) = self.inner.pool.get_relay(url, true, true) else {
                continue;
            };
            let wire_id = wire_id.clone();
            let relay_filters = relay_filters.to_vec();
            let manager = self.clone();
            let url = url.clone();
            tokio::spawn(async move {
                relay.wait_for_connected(connect_timeout).await;
                if let Err(e) = relay.req(&wire_id, &relay_filters).await {
                    debug!(relay = %url, error = %e, "wire subscription send failed");
                    manager.handle_eose(&wire_id, &url);
                }
            });
        }
    }

    fn select_relays(&self, filters: &[Filter], options: &SubscriptionOptions) -> RelaySetMapping {
        if !options.relay_urls.is_empty() {
            let mut mapping = RelaySetMapping::new();
            for url in &options.relay_urls {
                for filter in filters {
                    mapping.add(url.clone(), filter.clone());
                }
            }
            return mapping;
        }

        let explicit = if self.inner.config.explicit_relays.is_empty() {
            self.inner.pool.urls()
        } else {
            self.inner.config.explicit_relays.clone()
        };
        let snapshot = self.inner.outbox.snapshot();
        let mapping = calculate_relay_sets(
            filters,
            &snapshot,
            &explicit,
            self.inner.config.fallback_relay_limit,
        );
        correct_relay_set(&mapping, filters, &self.inner.pool)
    }

    // Cache

    async fn run_cache_query(&self, id: &str, filters: &[Filter]) {
        let Some(cache) = self.inner.cache.clone() else {
            return;
        };
        let deadline = self.inner.config.cache_timeout;
        let events = tokio::time::timeout(deadline, cache.query(filters))
            .await
            .unwrap_or_default();
        debug!(subscription = %id, events = events.len(), "cache answered");
        for event in events {
            self.route_event(event, None);
        }
    }

    fn finish_cache_only(&self, id: &str) {
        let mut closers = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.subscriptions.get_mut(id) {
                entry.state = SubscriptionState::Eosed;
                let _ = entry.sender.send(SubscriptionUpdate::Eose);
            }
            if let Some(entry) = state.subscriptions.remove(id) {
                self.retire_entry(&mut state, id, entry, "cache exhausted", &mut closers);
            }
        }
        self.run_wire_closers(closers);
    }

    // Teardown plumbing

    /// Finish a removed entry: notify, release outbox references, and
    /// when it was the last member of its wire query, collect the
    /// CLOSE work for `run_wire_closers`.
    fn retire_entry(
        &self,
        state: &mut ManagerState,
        id: &str,
        entry: SubscriptionEntry,
        message: &str,
        closers: &mut Vec<(String, Vec<RelayUrl>)>,
    ) {
        let _ = entry.sender.send(SubscriptionUpdate::Closed {
            message: message.to_string(),
        });
        for author in &entry.tracked_authors {
            self.inner.outbox.untrack(author);
        }

        if let Some(wire_id) = entry.wire_id {
            let emptied = match state.wires.get_mut(&wire_id) {
                Some(wire) => {
                    wire.members.retain(|member| member != id);
                    wire.members.is_empty()
                }
                None => false,
            };
            if emptied {
                if let Some(wire) = state.wires.remove(&wire_id) {
                    closers.push((wire_id, wire.serving.into_iter().collect()));
                }
            }
        }
    }

    fn run_wire_closers(&self, closers: Vec<(String, Vec<RelayUrl>)>) {
        for (wire_id, relays) in closers {
            for url in relays {
                let Some(relay) = self.inner.pool.relay(&url) else {
                    continue;
                };
                let wire_id = wire_id.clone();
                tokio::spawn(async move {
                    let _ = relay.close_subscription(&wire_id).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::outbox::StaticRelayListSource;
    use crate::transport::MemoryTransport;
    use std::time::Duration;

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    fn event(id: &str, author: &str, kind: u32) -> Event {
        Event {
            id: id.into(),
            pubkey: author.into(),
            created_at: 100,
            kind,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            groupable_delay: Duration::from_millis(20),
            eose_settle_delay: Duration::from_millis(30),
            connect_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        }
    }

    struct Fixture {
        transport: MemoryTransport,
        pool: Arc<RelayPool>,
        manager: SubscriptionManager,
    }

    fn fixture(cache: Option<Arc<dyn CacheAdapter>>) -> Fixture {
        let transport = MemoryTransport::new();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let config = fast_config();
        let pool = Arc::new(RelayPool::new(
            Arc::new(transport.clone()),
            config.clone(),
            inbox_tx,
        ));
        let outbox = Arc::new(OutboxTracker::new(
            Arc::new(StaticRelayListSource::new()),
            4,
        ));
        let manager = SubscriptionManager::new(Arc::clone(&pool), outbox, cache, config);
        manager.start(inbox_rx);
        Fixture {
            transport,
            pool,
            manager,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    #[tokio::test]
    async fn test_duplicate_delivery_from_two_relays_is_deduped() {
        let fx = fixture(None);
        let r1 = url("wss://one.test");
        let r2 = url("wss://two.test");
        fx.pool.add_relay(&r1, true).unwrap();
        fx.pool.add_relay(&r2, true).unwrap();
        fx.pool.connect_all(Duration::from_millis(500)).await;

        let mut handle = fx.manager.subscribe(
            vec![Filter::new().kinds([1])],
            SubscriptionOptions {
                groupable: false,
                cache_usage: CacheUsage::RelayOnly,
                ..SubscriptionOptions::default()
            },
        );
        settle().await;

        let e = event("dup", "alice", 1);
        fx.transport.broadcast_event(&r1, &e).await;
        fx.transport.broadcast_event(&r2, &e).await;
        settle().await;

        let mut deliveries = 0;
        while let Ok(Some(update)) =
            tokio::time::timeout(Duration::from_millis(50), handle.recv()).await
        {
            if let SubscriptionUpdate::Event { event, .. } = update {
                assert_eq!(event.id, "dup");
                deliveries += 1;
            }
        }
        assert_eq!(deliveries, 1);
        // the ledger still remembers both relays
        assert_eq!(fx.manager.seen_on("dup").len(), 2);
    }

    #[tokio::test]
    async fn test_identical_groupable_subscriptions_share_one_req() {
        let fx = fixture(None);
        let relay = url("wss://one.test");
        fx.pool.add_relay(&relay, true).unwrap();
        fx.pool.connect_all(Duration::from_millis(500)).await;

        let options = SubscriptionOptions {
            cache_usage: CacheUsage::RelayOnly,
            ..SubscriptionOptions::default()
        };
        let _a = fx
            .manager
            .subscribe(vec![Filter::new().kinds([1])], options.clone());
        let _b = fx
            .manager
            .subscribe(vec![Filter::new().kinds([1])], options);
        settle().await;

        assert_eq!(fx.transport.req_count(&relay), 1);
    }

    #[tokio::test]
    async fn test_non_groupable_subscriptions_each_get_a_req() {
        let fx = fixture(None);
        let relay = url("wss://one.test");
        fx.pool.add_relay(&relay, true).unwrap();
        fx.pool.connect_all(Duration::from_millis(500)).await;

        let options = SubscriptionOptions {
            groupable: false,
            cache_usage: CacheUsage::RelayOnly,
            ..SubscriptionOptions::default()
        };
        let _a = fx
            .manager
            .subscribe(vec![Filter::new().kinds([1])], options.clone());
        let _b = fx
            .manager
            .subscribe(vec![Filter::new().kinds([1])], options);
        settle().await;

        assert_eq!(fx.transport.req_count(&relay), 2);
    }

    #[tokio::test]
    async fn test_exclusive_relay_discards_other_relays() {
        let fx = fixture(None);
        let wanted = url("wss://wanted.test");
        let other = url("wss://other.test");
        fx.pool.add_relay(&wanted, true).unwrap();
        fx.pool.add_relay(&other, true).unwrap();
        fx.pool.connect_all(Duration::from_millis(500)).await;

        let mut handle = fx.manager.subscribe(
            vec![Filter::new().kinds([1])],
            SubscriptionOptions {
                groupable: false,
                cache_usage: CacheUsage::RelayOnly,
                relay_urls: vec![wanted.clone()],
                exclusive_relay: true,
                ..SubscriptionOptions::default()
            },
        );
        settle().await;

        fx.transport
            .broadcast_event(&other, &event("stray", "x", 1))
            .await;
        fx.transport
            .broadcast_event(&wanted, &event("good", "x", 1))
            .await;
        settle().await;

        let mut ids = Vec::new();
        while let Ok(Some(update)) =
            tokio::time::timeout(Duration::from_millis(50), handle.recv()).await
        {
            if let SubscriptionUpdate::Event { event, .. } = update {
                ids.push(event.id);
            }
        }
        assert_eq!(ids, vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn test_close_on_eose_closes_after_stored_events() {
        let fx = fixture(None);
        let relay = url("wss://one.test");
        fx.transport
            .stock_events(&relay, vec![event("stored", "alice", 1)]);
        fx.pool.add_relay(&relay, true).unwrap();
        fx.pool.connect_all(Duration::from_millis(500)).await;

        let mut handle = fx.manager.subscribe(
            vec![Filter::new().kinds([1])],
            SubscriptionOptions {
                groupable: false,
                close_on_eose: true,
                cache_usage: CacheUsage::RelayOnly,
                ..SubscriptionOptions::default()
            },
        );

        let mut saw_event = false;
        let mut saw_eose = false;
        let mut saw_closed = false;
        while let Ok(Some(update)) =
            tokio::time::timeout(Duration::from_millis(500), handle.recv()).await
        {
            match update {
                SubscriptionUpdate::Event { event, .. } => {
                    assert_eq!(event.id, "stored");
                    saw_event = true;
                }
                SubscriptionUpdate::Eose => saw_eose = true,
                SubscriptionUpdate::Closed { .. } => {
                    saw_closed = true;
                    break;
                }
            }
        }
        assert!(saw_event && saw_eose && saw_closed);
        assert_eq!(fx.manager.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_unregisters() {
        let fx = fixture(None);
        fx.pool.add_relay(&url("wss://one.test"), true).unwrap();
        fx.pool.connect_all(Duration::from_millis(500)).await;

        let handle = fx.manager.subscribe(
            vec![Filter::new().kinds([1])],
            SubscriptionOptions {
                groupable: false,
                cache_usage: CacheUsage::RelayOnly,
                ..SubscriptionOptions::default()
            },
        );
        settle().await;

        handle.stop();
        handle.stop();
        assert_eq!(handle.state(), SubscriptionState::Closed);
        assert_eq!(fx.manager.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_only_never_touches_the_network() {
        let cache = Arc::new(MemoryCache::new());
        cache.store(&event("cached", "alice", 1)).await;
        let fx = fixture(Some(cache));
        let relay = url("wss://one.test");
        fx.pool.add_relay(&relay, true).unwrap();
        fx.pool.connect_all(Duration::from_millis(500)).await;

        let mut handle = fx.manager.subscribe(
            vec![Filter::new().kinds([1])],
            SubscriptionOptions {
                cache_usage: CacheUsage::CacheOnly,
                ..SubscriptionOptions::default()
            },
        );

        let mut ids = Vec::new();
        let mut closed = false;
        while let Ok(Some(update)) =
            tokio::time::timeout(Duration::from_millis(500), handle.recv()).await
        {
            match update {
                SubscriptionUpdate::Event { event, relay } => {
                    assert!(relay.is_none());
                    ids.push(event.id);
                }
                SubscriptionUpdate::Eose => {}
                SubscriptionUpdate::Closed { .. } => {
                    closed = true;
                    break;
                }
            }
        }
        assert_eq!(ids, vec!["cached".to_string()]);
        assert!(closed);
        assert_eq!(fx.transport.req_count(&relay), 0);
    }

    #[tokio::test]
    async fn test_relay_events_are_stored_in_the_cache() {
        let cache = Arc::new(MemoryCache::new());
        let fx = fixture(Some(Arc::clone(&cache) as Arc<dyn CacheAdapter>));
        let relay = url("wss://one.test");
        fx.pool.add_relay(&relay, true).unwrap();
        fx.pool.connect_all(Duration::from_millis(500)).await;

        let _handle = fx.manager.subscribe(
            vec![Filter::new().kinds([1])],
            SubscriptionOptions {
                groupable: false,
                cache_usage: CacheUsage::RelayOnly,
                ..SubscriptionOptions::default()
            },
        );
        settle().await;

        fx.transport
            .broadcast_event(&relay, &event("live", "alice", 1))
            .await;
        settle().await;

        assert_eq!(cache.len(), 1);
    }
}
