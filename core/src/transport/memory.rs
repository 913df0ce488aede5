//! In-process transport with scripted relays
//!
//! Useful for tests and examples: every relay URL maps to a simulated
//! relay that answers `REQ` with its stocked events plus `EOSE`,
//! acknowledges publishes per its ack mode, and can have events or raw
//! frames injected mid-stream.

use super::{Transport, TransportConnection, TransportError, TransportEvent};
use crate::event::Event;
use crate::filter::Filter;
use crate::protocol::{ClientFrame, RelayFrame};
use crate::relay::RelayUrl;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

const CHANNEL_BUFFER: usize = 1024;

/// How a simulated relay answers publishes.
#[derive(Debug, Clone, Default)]
pub enum AckMode {
    /// Reply `OK <id> true`
    #[default]
    Accept,
    /// Reply `OK <id> false` with a reason
    Reject(String),
    /// Never reply (publish timeouts)
    Silent,
}

#[derive(Default)]
struct RelaySim {
    reachable: Option<bool>,
    ack_mode: AckMode,
    stored: Vec<Event>,
    published: Vec<Event>,
    req_log: Vec<(String, Vec<Filter>)>,
    connections: Vec<SimConnection>,
}

impl RelaySim {
    fn is_reachable(&self) -> bool {
        self.reachable.unwrap_or(true)
    }
}

#[derive(Clone)]
struct SimConnection {
    to_client: mpsc::Sender<TransportEvent>,
    subscriptions: Arc<Mutex<HashMap<String, Vec<Filter>>>>,
}

/// Shared hub of simulated relays.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    relays: Arc<Mutex<HashMap<RelayUrl, RelaySim>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load stored events a relay will answer `REQ`s with.
    pub fn stock_events(&self, url: &RelayUrl, events: Vec<Event>) {
        let mut relays = self.relays.lock();
        relays.entry(url.clone()).or_default().stored.extend(events);
    }

    /// Make a relay refuse (or again accept) new connections.
    pub fn set_reachable(&self, url: &RelayUrl, reachable: bool) {
        let mut relays = self.relays.lock();
        relays.entry(url.clone()).or_default().reachable = Some(reachable);
    }

    /// Configure publish acknowledgment behavior.
    pub fn set_ack_mode(&self, url: &RelayUrl, mode: AckMode) {
        let mut relays = self.relays.lock();
        relays.entry(url.clone()).or_default().ack_mode = mode;
    }

    /// Events a relay has received via `EVENT` frames.
    pub fn published(&self, url: &RelayUrl) -> Vec<Event> {
        self.relays
            .lock()
            .get(url)
            .map(|sim| sim.published.clone())
            .unwrap_or_default()
    }

    /// Number of `REQ` frames a relay has seen.
    pub fn req_count(&self, url: &RelayUrl) -> usize {
        self.relays
            .lock()
            .get(url)
            .map(|sim| sim.req_log.len())
            .unwrap_or(0)
    }

    /// Open connections to a relay.
    pub fn connection_count(&self, url: &RelayUrl) -> usize {
        self.relays
            .lock()
            .get(url)
            .map(|sim| sim.connections.len())
            .unwrap_or(0)
    }

    /// Deliver a live event to every open subscription it matches.
    pub async fn broadcast_event(&self, url: &RelayUrl, event: &Event) {
        let connections = self
            .relays
            .lock()
            .get(url)
            .map(|sim| sim.connections.clone())
            .unwrap_or_default();

        for connection in connections {
            let matching: Vec<String> = {
                let subscriptions = connection.subscriptions.lock();
                subscriptions
                    .iter()
                    .filter(|(_, filters)| filters.iter().any(|f| f.matches(event)))
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for subscription_id in matching {
                let frame = RelayFrame::Event {
                    subscription_id,
                    event: event.clone(),
                };
                let _ = connection
                    .to_client
                    .send(TransportEvent::Frame(frame.to_wire()))
                    .await;
            }
        }
    }

    /// Push a raw text frame to every open connection of a relay.
    pub async fn send_raw(&self, url: &RelayUrl, frame: &str) {
        let connections = self
            .relays
            .lock()
            .get(url)
            .map(|sim| sim.connections.clone())
            .unwrap_or_default();
        for connection in connections {
            let _ = connection
                .to_client
                .send(TransportEvent::Frame(frame.to_string()))
                .await;
        }
    }

    /// Kill every open connection to a relay, as a server crash would.
    pub async fn drop_connections(&self, url: &RelayUrl) {
        let connections = {
            let mut relays = self.relays.lock();
            match relays.get_mut(url) {
                Some(sim) => std::mem::take(&mut sim.connections),
                None => Vec::new(),
            }
        };
        for connection in connections {
            let _ = connection
                .to_client
                .send(TransportEvent::Closed {
                    reason: Some("connection dropped".to_string()),
                })
                .await;
        }
    }

    fn remove_connection(&self, url: &RelayUrl, subscriptions: &Arc<Mutex<HashMap<String, Vec<Filter>>>>) {
        let mut relays = self.relays.lock();
        if let Some(sim) = relays.get_mut(url) {
            sim.connections
                .retain(|c| !Arc::ptr_eq(&c.subscriptions, subscriptions));
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &RelayUrl) -> Result<TransportConnection, TransportError> {
        let (to_client, incoming) = mpsc::channel::<TransportEvent>(CHANNEL_BUFFER);
        let (outgoing, from_client) = mpsc::channel::<String>(CHANNEL_BUFFER);
        let subscriptions: Arc<Mutex<HashMap<String, Vec<Filter>>>> = Arc::default();

        {
            let mut relays = self.relays.lock();
            let sim = relays.entry(url.clone()).or_default();
            if !sim.is_reachable() {
                return Err(TransportError::Unreachable(url.clone()));
            }
            sim.connections.push(SimConnection {
                to_client: to_client.clone(),
                subscriptions: Arc::clone(&subscriptions),
            });
        }

        let hub = self.clone();
        let relay_url = url.clone();
        tokio::spawn(async move {
            hub.serve_connection(relay_url, from_client, to_client, subscriptions)
                .await;
        });

        Ok(TransportConnection { outgoing, incoming })
    }
}

impl MemoryTransport {
    async fn serve_connection(
        &self,
        url: RelayUrl,
        mut from_client: mpsc::Receiver<String>,
        to_client: mpsc::Sender<TransportEvent>,
        subscriptions: Arc<Mutex<HashMap<String, Vec<Filter>>>>,
    ) {
        while let Some(raw) = from_client.recv().await {
            let frame = match ClientFrame::from_wire(&raw) {
                Ok(frame) => frame,
                // a real relay would ignore garbage from us too
                Err(_) => continue,
            };
            match frame {
                ClientFrame::Req {
                    subscription_id,
                    filters,
                } => {
                    let stored: Vec<Event> = {
                        let mut relays = self.relays.lock();
                        let sim = relays.entry(url.clone()).or_default();
                        sim.req_log.push((subscription_id.clone(), filters.clone()));
                        sim.stored
                            .iter()
                            .filter(|event| filters.iter().any(|f| f.matches(event)))
                            .cloned()
                            .collect()
                    };
                    subscriptions
                        .lock()
                        .insert(subscription_id.clone(), filters);
                    for event in stored {
                        let frame = RelayFrame::Event {
                            subscription_id: subscription_id.clone(),
                            event,
                        };
                        if to_client
                            .send(TransportEvent::Frame(frame.to_wire()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    let eose = RelayFrame::Eose { subscription_id };
                    if to_client
                        .send(TransportEvent::Frame(eose.to_wire()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                ClientFrame::Close { subscription_id } => {
                    subscriptions.lock().remove(&subscription_id);
                }
                ClientFrame::Event { event } => {
                    let reply = {
                        let mut relays = self.relays.lock();
                        let sim = relays.entry(url.clone()).or_default();
                        sim.published.push(event.clone());
                        match &sim.ack_mode {
                            AckMode::Accept => Some(RelayFrame::Ok {
                                event_id: event.id.clone(),
                                accepted: true,
                                message: String::new(),
                            }),
                            AckMode::Reject(reason) => Some(RelayFrame::Ok {
                                event_id: event.id.clone(),
                                accepted: false,
                                message: reason.clone(),
                            }),
                            AckMode::Silent => None,
                        }
                    };
                    if let Some(frame) = reply {
                        if to_client
                            .send(TransportEvent::Frame(frame.to_wire()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                ClientFrame::Auth { .. } => {}
            }
        }
        // client hung up
        self.remove_connection(&url, &subscriptions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    fn event(id: &str, kind: u32) -> Event {
        Event {
            id: id.into(),
            pubkey: "author".into(),
            created_at: 1,
            kind,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[tokio::test]
    async fn test_req_answers_with_stored_events_and_eose() {
        let transport = MemoryTransport::new();
        let relay = url("wss://one.test");
        transport.stock_events(&relay, vec![event("a", 1), event("b", 2)]);

        let mut conn = transport.connect(&relay).await.unwrap();
        let req = ClientFrame::Req {
            subscription_id: "s1".into(),
            filters: vec![Filter::new().kinds([1])],
        };
        conn.outgoing.send(req.to_wire()).await.unwrap();

        let first = conn.incoming.recv().await.unwrap();
        let second = conn.incoming.recv().await.unwrap();
        match (first, second) {
            (TransportEvent::Frame(f1), TransportEvent::Frame(f2)) => {
                assert!(matches!(
                    RelayFrame::from_wire(&f1).unwrap(),
                    RelayFrame::Event { .. }
                ));
                assert!(matches!(
                    RelayFrame::from_wire(&f2).unwrap(),
                    RelayFrame::Eose { .. }
                ));
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(transport.req_count(&relay), 1);
    }

    #[tokio::test]
    async fn test_unreachable_relay_refuses_connections() {
        let transport = MemoryTransport::new();
        let relay = url("wss://down.test");
        transport.set_reachable(&relay, false);
        assert!(transport.connect(&relay).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_ack_modes() {
        let transport = MemoryTransport::new();
        let relay = url("wss://ack.test");
        let mut conn = transport.connect(&relay).await.unwrap();

        let frame = ClientFrame::Event {
            event: event("x", 1),
        };
        conn.outgoing.send(frame.to_wire()).await.unwrap();

        match conn.incoming.recv().await.unwrap() {
            TransportEvent::Frame(raw) => match RelayFrame::from_wire(&raw).unwrap() {
                RelayFrame::Ok { accepted, .. } => assert!(accepted),
                other => panic!("unexpected frame: {other:?}"),
            },
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(transport.published(&relay).len(), 1);
    }

    #[tokio::test]
    async fn test_drop_connections_emits_closed() {
        let transport = MemoryTransport::new();
        let relay = url("wss://flaky.test");
        let mut conn = transport.connect(&relay).await.unwrap();
        assert_eq!(transport.connection_count(&relay), 1);

        transport.drop_connections(&relay).await;
        match conn.incoming.recv().await.unwrap() {
            TransportEvent::Closed { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(transport.connection_count(&relay), 0);
    }
}
