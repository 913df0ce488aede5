//! Relay pool
//!
//! The pool is the only component that creates, owns, and removes
//! `Relay` handles. Everything else addresses relays by normalized URL
//! and resolves them here. Blacklisted URLs are silently refused, and
//! temporary relays (added for a single query) expire after a TTL.

use crate::config::ClientConfig;
use crate::relay::connectivity::{InboundFrame, Relay, RelayEvent, RelayStatus};
use crate::relay::RelayUrl;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Pool-level connectivity notifications, tagged with the relay URL.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    RelayAdded(RelayUrl),
    RelayRemoved(RelayUrl),
    RelayConnecting(RelayUrl),
    RelayConnected(RelayUrl),
    RelayDisconnected(RelayUrl),
    RelayFlapping(RelayUrl),
    Notice { relay: RelayUrl, message: String },
    AuthRequested { relay: RelayUrl, challenge: String },
}

/// Connectivity summary across the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub disconnected: usize,
    pub temporary: usize,
}

struct RelayEntry {
    relay: Relay,
    /// Expiry for temporary relays; permanent entries have none.
    expires_at: Option<Instant>,
}

struct PoolState {
    relays: HashMap<RelayUrl, RelayEntry>,
    blacklist: HashSet<RelayUrl>,
}

/// Owner of all relay connections.
pub struct RelayPool {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    state: Mutex<PoolState>,
    events: broadcast::Sender<PoolEvent>,
    inbox: mpsc::UnboundedSender<InboundFrame>,
}

impl RelayPool {
    /// Inbound frames from every relay in the pool are funneled into
    /// `inbox`, whose receiving side belongs to the subscription
    /// manager.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        inbox: mpsc::UnboundedSender<InboundFrame>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let blacklist = config.blacklisted_relays.iter().cloned().collect();
        Self {
            transport,
            config,
            state: Mutex::new(PoolState {
                relays: HashMap::new(),
                blacklist,
            }),
            events,
            inbox,
        }
    }

    /// Subscribe to pool-level connectivity notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Add a permanent relay. Idempotent per normalized URL; a no-op
    /// for blacklisted URLs. Returns the handle unless blacklisted.
    pub fn add_relay(&self, url: &RelayUrl, connect: bool) -> Option<Relay> {
        self.insert(url, connect, None)
    }

    /// Resolve a relay handle, creating the relay when missing. A
    /// created relay is temporary when `temporary` is set and expires
    /// after a period of no lookups; resolving it again extends the
    /// lease, and a permanent add upgrades it for good.
    pub fn get_relay(&self, url: &RelayUrl, connect: bool, temporary: bool) -> Option<Relay> {
        let expiry = temporary.then(|| Instant::now() + self.config.temporary_relay_ttl);
        self.insert(url, connect, expiry)
    }

    fn insert(&self, url: &RelayUrl, connect: bool, expiry: Option<Instant>) -> Option<Relay> {
        let (relay, created) = {
            let mut state = self.state.lock();
            if state.blacklist.contains(url) {
                debug!(url = %url, "refusing blacklisted relay");
                return None;
            }
            match state.relays.get_mut(url) {
                Some(entry) => {
                    // permanent wins; a temporary lookup extends its lease
                    entry.expires_at = match (entry.expires_at, expiry) {
                        (None, _) | (_, None) => None,
                        (Some(_), Some(extended)) => Some(extended),
                    };
                    (entry.relay.clone(), false)
                }
                None => {
                    let relay = Relay::new(
                        url.clone(),
                        Arc::clone(&self.transport),
                        self.inbox.clone(),
                        self.config.connectivity.clone(),
                    );
                    state.relays.insert(
                        url.clone(),
                        RelayEntry {
                            relay: relay.clone(),
                            expires_at: expiry,
                        },
                    );
                    (relay, true)
                }
            }
        };

        if created {
            info!(url = %url, temporary = expiry.is_some(), "relay added to pool");
            self.forward_relay_events(&relay);
            let _ = self.events.send(PoolEvent::RelayAdded(url.clone()));
        }
        if connect && !relay.is_connected() {
            let relay = relay.clone();
            tokio::spawn(async move { relay.connect().await });
        }
        Some(relay)
    }

    /// Remove a relay and close its connection.
    pub fn remove_relay(&self, url: &RelayUrl) -> bool {
        let removed = self.state.lock().relays.remove(url);
        match removed {
            Some(entry) => {
                info!(url = %url, "relay removed from pool");
                let _ = self.events.send(PoolEvent::RelayRemoved(url.clone()));
                tokio::spawn(async move { entry.relay.disconnect().await });
                true
            }
            None => false,
        }
    }

    /// Blacklist a URL; any existing relay under it is removed.
    pub fn blacklist_relay(&self, url: &RelayUrl) {
        self.state.lock().blacklist.insert(url.clone());
        self.remove_relay(url);
    }

    /// Look up an existing relay without creating one.
    pub fn relay(&self, url: &RelayUrl) -> Option<Relay> {
        self.sweep_expired();
        self.state
            .lock()
            .relays
            .get(url)
            .map(|entry| entry.relay.clone())
    }

    /// All current relay handles.
    pub fn all_relays(&self) -> Vec<Relay> {
        self.sweep_expired();
        self.state
            .lock()
            .relays
            .values()
            .map(|entry| entry.relay.clone())
            .collect()
    }

    /// Relays with an open connection.
    pub fn connected_relays(&self) -> Vec<Relay> {
        self.all_relays()
            .into_iter()
            .filter(|relay| relay.is_connected())
            .collect()
    }

    /// URLs of every relay in the pool.
    pub fn urls(&self) -> Vec<RelayUrl> {
        self.all_relays()
            .into_iter()
            .map(|relay| relay.url().clone())
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        self.sweep_expired();
        let state = self.state.lock();
        let mut stats = PoolStats {
            total: state.relays.len(),
            ..PoolStats::default()
        };
        for entry in state.relays.values() {
            match entry.relay.status() {
                s if s.is_connected() => stats.connected += 1,
                RelayStatus::Connecting | RelayStatus::Reconnecting => stats.connecting += 1,
                _ => stats.disconnected += 1,
            }
            if entry.expires_at.is_some() {
                stats.temporary += 1;
            }
        }
        stats
    }

    /// Dial every relay and wait until all are connected or `timeout`
    /// elapses, whichever comes first. Always resolves at the timeout;
    /// stragglers keep connecting in the background.
    pub async fn connect_all(&self, timeout: Duration) {
        let relays = self.all_relays();
        for relay in &relays {
            let relay = relay.clone();
            tokio::spawn(async move { relay.connect().await });
        }
        let waits = relays
            .iter()
            .map(|relay| relay.wait_for_connected(timeout));
        futures::future::join_all(waits).await;
        debug!(
            connected = self.connected_relays().len(),
            total = relays.len(),
            "pool connect settled"
        );
    }

    /// Disconnect every relay.
    pub async fn disconnect_all(&self) {
        for relay in self.all_relays() {
            relay.disconnect().await;
        }
    }

    /// Drop temporary relays whose lease ran out.
    fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(RelayUrl, Relay)> = {
            let mut state = self.state.lock();
            let urls: Vec<RelayUrl> = state
                .relays
                .iter()
                .filter(|(_, entry)| matches!(entry.expires_at, Some(at) if at <= now))
                .map(|(url, _)| url.clone())
                .collect();
            urls.into_iter()
                .filter_map(|url| {
                    state
                        .relays
                        .remove(&url)
                        .map(|entry| (url, entry.relay))
                })
                .collect()
        };
        for (url, relay) in expired {
            debug!(url = %url, "temporary relay expired");
            let _ = self.events.send(PoolEvent::RelayRemoved(url));
            tokio::spawn(async move { relay.disconnect().await });
        }
    }

    fn forward_relay_events(&self, relay: &Relay) {
        let mut events = relay.subscribe_events();
        let pool_events = self.events.clone();
        let url = relay.url().clone();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let mapped = match event {
                    RelayEvent::Connected => PoolEvent::RelayConnected(url.clone()),
                    RelayEvent::Disconnected => PoolEvent::RelayDisconnected(url.clone()),
                    RelayEvent::Flapping => PoolEvent::RelayFlapping(url.clone()),
                    RelayEvent::Notice(message) => PoolEvent::Notice {
                        relay: url.clone(),
                        message,
                    },
                    RelayEvent::AuthRequested(challenge) => PoolEvent::AuthRequested {
                        relay: url.clone(),
                        challenge,
                    },
                    RelayEvent::Connecting => PoolEvent::RelayConnecting(url.clone()),
                };
                let _ = pool_events.send(mapped);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    fn test_pool(transport: &MemoryTransport, config: ClientConfig) -> RelayPool {
        // inbound frames are discarded; these tests only exercise
        // pool membership and connectivity
        let (inbox, _rx) = mpsc::unbounded_channel();
        std::mem::forget(_rx);
        RelayPool::new(Arc::new(transport.clone()), config, inbox)
    }

    #[tokio::test]
    async fn test_add_is_idempotent_per_normalized_url() {
        let transport = MemoryTransport::new();
        let pool = test_pool(&transport, ClientConfig::default());

        pool.add_relay(&url("wss://one.test"), false).unwrap();
        pool.add_relay(&url("WSS://ONE.test/"), false).unwrap();
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn test_blacklisted_add_is_a_no_op() {
        let transport = MemoryTransport::new();
        let config = ClientConfig {
            blacklisted_relays: vec![url("wss://bad.test")],
            ..ClientConfig::default()
        };
        let pool = test_pool(&transport, config);

        assert!(pool.add_relay(&url("wss://bad.test"), false).is_none());
        assert!(pool.get_relay(&url("wss://bad.test"), false, true).is_none());
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_blacklist_removes_existing_relay() {
        let transport = MemoryTransport::new();
        let pool = test_pool(&transport, ClientConfig::default());

        pool.add_relay(&url("wss://one.test"), false).unwrap();
        pool.blacklist_relay(&url("wss://one.test"));
        assert_eq!(pool.stats().total, 0);
        assert!(pool.add_relay(&url("wss://one.test"), false).is_none());
    }

    #[tokio::test]
    async fn test_temporary_relay_expires() {
        let transport = MemoryTransport::new();
        let config = ClientConfig {
            temporary_relay_ttl: Duration::from_millis(20),
            ..ClientConfig::default()
        };
        let pool = test_pool(&transport, config);

        pool.get_relay(&url("wss://temp.test"), false, true).unwrap();
        assert_eq!(pool.stats().total, 1);
        assert_eq!(pool.stats().temporary, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_permanent_add_upgrades_temporary() {
        let transport = MemoryTransport::new();
        let config = ClientConfig {
            temporary_relay_ttl: Duration::from_millis(20),
            ..ClientConfig::default()
        };
        let pool = test_pool(&transport, config);

        pool.get_relay(&url("wss://temp.test"), false, true).unwrap();
        pool.add_relay(&url("wss://temp.test"), false).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().total, 1);
        assert_eq!(pool.stats().temporary, 0);
    }

    #[tokio::test]
    async fn test_connect_all_resolves_despite_unreachable_relay() {
        let transport = MemoryTransport::new();
        transport.set_reachable(&url("wss://down.test"), false);
        let pool = test_pool(&transport, ClientConfig::default());

        pool.add_relay(&url("wss://up.test"), false).unwrap();
        pool.add_relay(&url("wss://down.test"), false).unwrap();

        pool.connect_all(Duration::from_millis(200)).await;
        let connected = pool.connected_relays();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].url(), &url("wss://up.test"));
    }

    #[tokio::test]
    async fn test_pool_rebroadcasts_relay_events() {
        let transport = MemoryTransport::new();
        let pool = test_pool(&transport, ClientConfig::default());
        let mut events = pool.subscribe_events();

        pool.add_relay(&url("wss://one.test"), true).unwrap();

        let mut saw_added = false;
        let mut saw_connecting = false;
        let mut saw_connected = false;
        for _ in 0..6 {
            match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
                Ok(Ok(PoolEvent::RelayAdded(_))) => saw_added = true,
                Ok(Ok(PoolEvent::RelayConnecting(_))) => saw_connecting = true,
                Ok(Ok(PoolEvent::RelayConnected(_))) => saw_connected = true,
                Ok(Ok(_)) => {}
                _ => break,
            }
            if saw_added && saw_connecting && saw_connected {
                break;
            }
        }
        assert!(saw_added);
        assert!(saw_connecting);
        assert!(saw_connected);
    }
}
