//! Client façade
//!
//! Wires the pool, subscription manager, outbox tracker, and cache
//! together behind one handle. Built through `ClientBuilder`; the
//! transport, cache adapter, and relay-list source are all injectable,
//! with production defaults.

use crate::cache::CacheAdapter;
use crate::config::ClientConfig;
use crate::event::Event;
use crate::filter::Filter;
use crate::outbox::{OutboxError, OutboxTracker, RelayList, RelayListSource};
use crate::publish::{publish_to_set, PublishError, PublishReport};
use crate::relay::pool::{PoolEvent, PoolStats, RelayPool};
use crate::relay::RelayUrl;
use crate::subscription::{
    SubscriptionHandle, SubscriptionManager, SubscriptionOptions, SubscriptionUpdate,
};
use crate::transport::{Transport, WebSocketTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Kind of the replaceable record carrying an author's relay list.
const RELAY_LIST_KIND: u32 = 10002;
const RELAY_LIST_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves author relay lists by querying the network for their
/// relay-list record through the subscription manager.
///
/// Attached to the manager after construction because the manager
/// itself depends on the outbox tracker this source feeds.
pub struct LiveRelayListSource {
    manager: Mutex<Option<SubscriptionManager>>,
}

impl LiveRelayListSource {
    pub fn new() -> Self {
        Self {
            manager: Mutex::new(None),
        }
    }

    pub fn attach(&self, manager: SubscriptionManager) {
        *self.manager.lock() = Some(manager);
    }
}

impl Default for LiveRelayListSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay lists from a relay-list record's `r` tags. An unmarked tag
/// advertises the relay for both reading and writing.
fn relay_lists_of(event: &Event) -> RelayList {
    let mut lists = RelayList::default();
    for tag in &event.tags {
        if tag.first().map(String::as_str) != Some("r") {
            continue;
        }
        let Some(raw) = tag.get(1) else { continue };
        let Ok(url) = RelayUrl::parse(raw) else { continue };
        let marker = tag.get(2).map(String::as_str);
        if matches!(marker, None | Some("write")) && !lists.write.contains(&url) {
            lists.write.push(url.clone());
        }
        if matches!(marker, None | Some("read")) && !lists.read.contains(&url) {
            lists.read.push(url);
        }
    }
    lists
}

#[async_trait]
impl RelayListSource for LiveRelayListSource {
    async fn fetch_relay_list(
        &self,
        author: &str,
        hints: &[RelayUrl],
    ) -> Result<RelayList, OutboxError> {
        let manager = self
            .manager
            .lock()
            .clone()
            .ok_or_else(|| OutboxError::Fetch("relay list source not attached".into()))?;

        let filter = Filter::new()
            .kinds([RELAY_LIST_KIND])
            .authors([author])
            .limit(1);
        let options = SubscriptionOptions {
            groupable: false,
            close_on_eose: true,
            relay_urls: hints.to_vec(),
            ..SubscriptionOptions::default()
        };
        let mut handle = manager.subscribe(vec![filter], options);

        let mut newest: Option<Event> = None;
        let collect = async {
            while let Some(update) = handle.recv().await {
                match update {
                    SubscriptionUpdate::Event { event, .. } => {
                        let newer = newest
                            .as_ref()
                            .map(|held| event.created_at > held.created_at)
                            .unwrap_or(true);
                        if newer {
                            newest = Some(event);
                        }
                    }
                    SubscriptionUpdate::Eose => {}
                    SubscriptionUpdate::Closed { .. } => break,
                }
            }
        };
        if tokio::time::timeout(RELAY_LIST_FETCH_TIMEOUT, collect)
            .await
            .is_err()
        {
            handle.stop();
        }
        Ok(newest.map(|event| relay_lists_of(&event)).unwrap_or_default())
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    cache: Option<Arc<dyn CacheAdapter>>,
    relay_list_source: Option<Arc<dyn RelayListSource>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            transport: None,
            cache: None,
            relay_list_source: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an explicit relay the client always keeps in its pool.
    pub fn relay(mut self, url: RelayUrl) -> Self {
        self.config.explicit_relays.push(url);
        self
    }

    pub fn blacklist(mut self, url: RelayUrl) -> Self {
        self.config.blacklisted_relays.push(url);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheAdapter>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn relay_list_source(mut self, source: Arc<dyn RelayListSource>) -> Self {
        self.relay_list_source = Some(source);
        self
    }

    pub fn build(self) -> Client {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WebSocketTransport::new()));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(RelayPool::new(transport, self.config.clone(), inbox_tx));
        for url in &self.config.explicit_relays {
            pool.add_relay(url, false);
        }

        let (source, live_source): (Arc<dyn RelayListSource>, Option<Arc<LiveRelayListSource>>) =
            match self.relay_list_source {
                Some(source) => (source, None),
                None => {
                    let live = Arc::new(LiveRelayListSource::new());
                    (Arc::clone(&live) as Arc<dyn RelayListSource>, Some(live))
                }
            };
        let outbox = Arc::new(OutboxTracker::new(source, self.config.outbox_concurrency));

        let manager = SubscriptionManager::new(
            Arc::clone(&pool),
            Arc::clone(&outbox),
            self.cache,
            self.config.clone(),
        );
        manager.start(inbox_rx);
        if let Some(live) = live_source {
            live.attach(manager.clone());
        }

        info!(relays = self.config.explicit_relays.len(), "client built");
        Client {
            config: self.config,
            pool,
            manager,
            outbox,
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running client.
pub struct Client {
    config: ClientConfig,
    pool: Arc<RelayPool>,
    manager: SubscriptionManager,
    outbox: Arc<OutboxTracker>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Dial every pool relay; resolves at the configured connect
    /// timeout whether or not every relay made it.
    pub async fn connect(&self) {
        self.pool.connect_all(self.config.connect_timeout).await;
    }

    pub async fn disconnect(&self) {
        self.pool.disconnect_all().await;
    }

    pub fn subscribe(
        &self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> SubscriptionHandle {
        self.manager.subscribe(filters, options)
    }

    /// Publish to the author's write relays when their relay list is
    /// known, otherwise to the whole pool.
    pub async fn publish(&self, event: &Event) -> Result<PublishReport, PublishError> {
        let relays = match self.outbox.write_relays(&event.pubkey) {
            Some(relays) if !relays.is_empty() => relays,
            _ => {
                debug!(author = %event.pubkey, "no relay list known, publishing to pool");
                self.pool.urls()
            }
        };
        self.publish_to(event, &relays, 0).await
    }

    /// Publish to an explicit relay set with a minimum-ack threshold
    /// (0 means none).
    pub async fn publish_to(
        &self,
        event: &Event,
        relays: &[RelayUrl],
        required_acks: usize,
    ) -> Result<PublishReport, PublishError> {
        publish_to_set(
            &self.pool,
            event,
            relays,
            self.config.publish_timeout,
            required_acks,
        )
        .await
    }

    pub fn add_relay(&self, url: &RelayUrl) -> bool {
        self.pool.add_relay(url, true).is_some()
    }

    pub fn blacklist_relay(&self, url: &RelayUrl) {
        self.pool.blacklist_relay(url);
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn subscribe_pool_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool.subscribe_events()
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    pub fn outbox(&self) -> &Arc<OutboxTracker> {
        &self.outbox
    }
}
