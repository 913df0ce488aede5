//! Relay connectivity state machine
//!
//! One `Relay` is one logical connection to one relay endpoint. The
//! state machine recovers from transport faults on its own: errors are
//! never returned to subscribe/publish callers, they drive transitions
//! and surface as `RelayEvent`s. Reconnection uses quadratic backoff,
//! `(base * (n + 1))²` for attempt `n`, computed with plain
//! multiplication and capped.

use crate::config::ConnectivityConfig;
use crate::event::{Event, EventId};
use crate::filter::Filter;
use crate::protocol::{ClientFrame, RelayFrame};
use crate::relay::info::{self, RelayInformation};
use crate::relay::RelayUrl;
use crate::transport::{Transport, TransportEvent};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Upper bound on retained connection-duration samples.
const MAX_DURATION_SAMPLES: usize = 100;

/// Flapping: standard deviation of recent connection durations below
/// this means the relay is cycling, not serving.
const FLAPPING_STDDEV_MS: f64 = 1000.0;

/// Cached info documents are refreshed after this long.
const INFO_FRESHNESS: Duration = Duration::from_secs(60 * 60);

/// Relay connection error types
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("Not connected to {0}")]
    NotConnected(RelayUrl),
    #[error("Info fetch failed: {0}")]
    InfoFetch(String),
}

/// Connectivity state of a relay.
///
/// `Reconnecting` is the automatic sub-state of disconnected: a
/// reconnect timer is pending. `Flapping` pauses automatic reconnects
/// until an explicit `connect()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Flapping,
    Disconnecting,
    Reconnecting,
}

impl RelayStatus {
    /// Connected at the transport level (possibly mid-auth).
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            RelayStatus::Connected | RelayStatus::Authenticating | RelayStatus::Authenticated
        )
    }

    fn can_dial(&self) -> bool {
        matches!(
            self,
            RelayStatus::Disconnected | RelayStatus::Flapping | RelayStatus::Reconnecting
        )
    }
}

/// Counters and samples for one relay connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Connection attempts, lifetime
    pub attempts: u32,
    /// Successful connections, lifetime
    pub successes: u32,
    /// Consecutive failed or short-lived connections; drives backoff
    pub consecutive_failures: u32,
    /// When the current connection opened
    pub connected_at: Option<Instant>,
    /// Durations of past connections, most recent last
    pub durations: Vec<Duration>,
}

impl ConnectionStats {
    fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    fn record_connected(&mut self) {
        self.successes += 1;
        self.connected_at = Some(Instant::now());
    }

    /// Record the end of a connection; returns whether it was
    /// sustained long enough to reset the backoff.
    fn record_disconnected(&mut self, sustained_threshold: Duration) -> bool {
        let sustained = match self.connected_at.take() {
            Some(started) => {
                let duration = started.elapsed();
                self.durations.push(duration);
                if self.durations.len() > MAX_DURATION_SAMPLES {
                    self.durations.remove(0);
                }
                duration >= sustained_threshold
            }
            None => false,
        };
        if sustained {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        sustained
    }

    /// Rapid connect/disconnect cycling: sampled every third duration,
    /// flapping when the durations barely vary.
    fn is_flapping(&self) -> bool {
        let durations = &self.durations;
        if durations.is_empty() || durations.len() % 3 != 0 {
            return false;
        }
        let ms: Vec<f64> = durations.iter().map(|d| d.as_millis() as f64).collect();
        let avg = ms.iter().sum::<f64>() / ms.len() as f64;
        let variance = ms.iter().map(|x| (x - avg).powi(2)).sum::<f64>() / ms.len() as f64;
        variance.sqrt() < FLAPPING_STDDEV_MS
    }
}

/// Delay before reconnect attempt `attempt` (0-indexed).
///
/// Quadratic, not exponential: `(base_ms * (attempt + 1))²`, capped.
/// Plain multiplication throughout; the growth is the square of a
/// linear ramp, so with a 1 s base the first retry waits 1_000_000 ms
/// and the second 4_000_000 ms.
pub fn reconnect_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let step = base.as_millis().saturating_mul(attempt as u128 + 1);
    let squared = step.saturating_mul(step);
    Duration::from_millis(squared.min(max.as_millis()) as u64)
}

/// Connectivity notifications for observers (metrics, UI).
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Connecting,
    Connected,
    Disconnected,
    Flapping,
    Notice(String),
    AuthRequested(String),
}

/// An inbound frame tagged with the relay that delivered it, fed to
/// the subscription manager's inbox.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Event {
        relay: RelayUrl,
        subscription_id: String,
        event: Event,
    },
    Eose {
        relay: RelayUrl,
        subscription_id: String,
    },
    Closed {
        relay: RelayUrl,
        subscription_id: String,
        message: String,
    },
}

/// Publish acknowledgment from one relay.
#[derive(Debug, Clone)]
pub struct PublishAck {
    pub accepted: bool,
    pub message: String,
}

struct RelayInner {
    url: RelayUrl,
    transport: Arc<dyn Transport>,
    config: ConnectivityConfig,
    status: watch::Sender<RelayStatus>,
    stats: Mutex<ConnectionStats>,
    info: Mutex<Option<(RelayInformation, Instant)>>,
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
    pending_publishes: Mutex<HashMap<EventId, VecDeque<oneshot::Sender<PublishAck>>>>,
    events: broadcast::Sender<RelayEvent>,
    inbox: mpsc::UnboundedSender<InboundFrame>,
    explicit_close: AtomicBool,
    reconnect_scheduled: AtomicBool,
}

/// One relay connection. Cheap to clone; all clones share state.
///
/// Constructed by `RelayPool` only — everything else resolves relays
/// through the pool by URL.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    pub(crate) fn new(
        url: RelayUrl,
        transport: Arc<dyn Transport>,
        inbox: mpsc::UnboundedSender<InboundFrame>,
        config: ConnectivityConfig,
    ) -> Self {
        let (status, _) = watch::channel(RelayStatus::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RelayInner {
                url,
                transport,
                config,
                status,
                stats: Mutex::new(ConnectionStats::default()),
                info: Mutex::new(None),
                outgoing: Mutex::new(None),
                pending_publishes: Mutex::new(HashMap::new()),
                events,
                inbox,
                explicit_close: AtomicBool::new(false),
                reconnect_scheduled: AtomicBool::new(false),
            }),
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.inner.url
    }

    pub fn status(&self) -> RelayStatus {
        *self.inner.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.inner.stats.lock().clone()
    }

    /// Watch connectivity state changes.
    pub fn subscribe_status(&self) -> watch::Receiver<RelayStatus> {
        self.inner.status.subscribe()
    }

    /// Subscribe to connectivity notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    fn set_status(&self, status: RelayStatus) {
        self.inner.status.send_replace(status);
    }

    fn emit(&self, event: RelayEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Open the transport. No-op when already connected or connecting.
    /// Transport failures are absorbed: they schedule a reconnect and
    /// surface only as events.
    pub async fn connect(&self) {
        if !self.status().can_dial() {
            return;
        }
        self.inner.explicit_close.store(false, Ordering::SeqCst);
        self.set_status(RelayStatus::Connecting);
        self.emit(RelayEvent::Connecting);
        self.inner.stats.lock().record_attempt();

        match self.inner.transport.connect(&self.inner.url).await {
            Ok(connection) => {
                *self.inner.outgoing.lock() = Some(connection.outgoing);
                self.inner.stats.lock().record_connected();
                self.set_status(RelayStatus::Connected);
                self.emit(RelayEvent::Connected);
                debug!(url = %self.inner.url, "relay connected");

                let relay = self.clone();
                tokio::spawn(async move {
                    relay.read_loop(connection.incoming).await;
                });
            }
            Err(e) => {
                debug!(url = %self.inner.url, error = %e, "relay connect failed");
                self.inner.stats.lock().consecutive_failures += 1;
                self.set_status(RelayStatus::Disconnected);
                self.emit(RelayEvent::Disconnected);
                if !self.inner.explicit_close.load(Ordering::SeqCst) {
                    self.schedule_reconnect();
                }
            }
        }
    }

    /// Close the connection and suppress the automatic reconnect for
    /// this disconnect only.
    pub async fn disconnect(&self) {
        self.inner.explicit_close.store(true, Ordering::SeqCst);
        if self.status().is_connected() {
            self.set_status(RelayStatus::Disconnecting);
        }
        // dropping the sink closes the transport; the read loop
        // observes the close and finishes the transition
        let closed = self.inner.outgoing.lock().take();
        if closed.is_none() {
            self.set_status(RelayStatus::Disconnected);
        }
    }

    /// Block until the relay is connected, or `timeout` elapses.
    pub async fn wait_for_connected(&self, timeout: Duration) -> bool {
        let mut status = self.subscribe_status();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if status.borrow().is_connected() {
                return true;
            }
            match tokio::time::timeout_at(deadline, status.changed()).await {
                Ok(Ok(())) => continue,
                // sender dropped or deadline hit
                Ok(Err(_)) | Err(_) => return status.borrow().is_connected(),
            }
        }
    }

    async fn read_loop(&self, mut incoming: mpsc::Receiver<TransportEvent>) {
        loop {
            match incoming.recv().await {
                Some(TransportEvent::Frame(text)) => self.handle_frame(&text),
                Some(TransportEvent::Closed { reason }) => {
                    debug!(url = %self.inner.url, ?reason, "relay connection closed");
                    break;
                }
                Some(TransportEvent::Error(error)) => {
                    debug!(url = %self.inner.url, %error, "relay connection error");
                    break;
                }
                None => break,
            }
        }
        self.on_disconnect();
    }

    fn on_disconnect(&self) {
        *self.inner.outgoing.lock() = None;

        let (sustained, flapping) = {
            let mut stats = self.inner.stats.lock();
            let sustained = stats.record_disconnected(self.inner.config.sustained_threshold);
            (sustained, stats.is_flapping())
        };
        if sustained {
            debug!(url = %self.inner.url, "sustained connection ended, backoff reset");
        }
        self.emit(RelayEvent::Disconnected);

        if self.inner.explicit_close.load(Ordering::SeqCst) {
            self.set_status(RelayStatus::Disconnected);
            return;
        }
        if flapping {
            warn!(url = %self.inner.url, "relay is flapping, reconnects paused");
            self.set_status(RelayStatus::Flapping);
            self.emit(RelayEvent::Flapping);
            return;
        }
        self.set_status(RelayStatus::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        if self.inner.reconnect_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let attempt = self
            .inner
            .stats
            .lock()
            .consecutive_failures
            .saturating_sub(1);
        let delay = reconnect_delay(
            self.inner.config.reconnect_base_delay,
            attempt,
            self.inner.config.max_reconnect_delay,
        );
        debug!(url = %self.inner.url, attempt, ?delay, "scheduling reconnect");
        self.set_status(RelayStatus::Reconnecting);

        let relay = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            relay.inner.reconnect_scheduled.store(false, Ordering::SeqCst);
            // an explicit connect or disconnect may have won the race
            if relay.status() == RelayStatus::Reconnecting
                && !relay.inner.explicit_close.load(Ordering::SeqCst)
            {
                relay.connect().await;
            }
        });
    }

    fn handle_frame(&self, raw: &str) {
        let frame = match RelayFrame::from_wire(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(url = %self.inner.url, error = %e, "dropping malformed frame");
                return;
            }
        };
        match frame {
            RelayFrame::Event {
                subscription_id,
                event,
            } => {
                let _ = self.inner.inbox.send(InboundFrame::Event {
                    relay: self.inner.url.clone(),
                    subscription_id,
                    event,
                });
            }
            RelayFrame::Eose { subscription_id } => {
                let _ = self.inner.inbox.send(InboundFrame::Eose {
                    relay: self.inner.url.clone(),
                    subscription_id,
                });
            }
            RelayFrame::Closed {
                subscription_id,
                message,
            } => {
                let _ = self.inner.inbox.send(InboundFrame::Closed {
                    relay: self.inner.url.clone(),
                    subscription_id,
                    message,
                });
            }
            RelayFrame::Ok {
                event_id,
                accepted,
                message,
            } => self.resolve_publish(&event_id, PublishAck { accepted, message }),
            RelayFrame::Notice { message } => {
                debug!(url = %self.inner.url, notice = %message, "relay notice");
                self.emit(RelayEvent::Notice(message));
            }
            RelayFrame::Auth { challenge } => {
                self.emit(RelayEvent::AuthRequested(challenge));
            }
        }
    }

    fn resolve_publish(&self, event_id: &str, ack: PublishAck) {
        let mut pending = self.inner.pending_publishes.lock();
        match pending.get_mut(event_id) {
            Some(waiters) => {
                if let Some(waiter) = waiters.pop_front() {
                    let _ = waiter.send(ack);
                }
                if waiters.is_empty() {
                    pending.remove(event_id);
                }
            }
            None => {
                debug!(url = %self.inner.url, event_id, "OK for unknown publish");
            }
        }
    }

    /// Send a raw client frame. Fails only when not connected.
    pub async fn send_frame(&self, frame: &ClientFrame) -> Result<(), RelayError> {
        let sender = self
            .inner
            .outgoing
            .lock()
            .clone()
            .ok_or_else(|| RelayError::NotConnected(self.inner.url.clone()))?;
        sender
            .send(frame.to_wire())
            .await
            .map_err(|_| RelayError::NotConnected(self.inner.url.clone()))
    }

    /// Open a wire subscription on this relay.
    pub async fn req(&self, subscription_id: &str, filters: &[Filter]) -> Result<(), RelayError> {
        self.send_frame(&ClientFrame::Req {
            subscription_id: subscription_id.to_string(),
            filters: filters.to_vec(),
        })
        .await
    }

    /// Close a wire subscription on this relay.
    pub async fn close_subscription(&self, subscription_id: &str) -> Result<(), RelayError> {
        self.send_frame(&ClientFrame::Close {
            subscription_id: subscription_id.to_string(),
        })
        .await
    }

    /// Send one event; the returned channel resolves with the relay's
    /// acknowledgment. Repeated publishes of the same event queue
    /// waiters in FIFO order.
    pub async fn publish(&self, event: &Event) -> Result<oneshot::Receiver<PublishAck>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_publishes
            .lock()
            .entry(event.id.clone())
            .or_default()
            .push_back(tx);

        let result = self
            .send_frame(&ClientFrame::Event {
                event: event.clone(),
            })
            .await;
        if result.is_err() {
            // roll the waiter back out
            let mut pending = self.inner.pending_publishes.lock();
            if let Some(waiters) = pending.get_mut(&event.id) {
                waiters.pop_back();
                if waiters.is_empty() {
                    pending.remove(&event.id);
                }
            }
        }
        result.map(|()| rx)
    }

    /// Mark the connection as answering an auth challenge.
    pub fn set_authenticating(&self) {
        if self.status() == RelayStatus::Connected {
            self.set_status(RelayStatus::Authenticating);
        }
    }

    /// Mark the connection as authenticated.
    pub fn set_authenticated(&self) {
        if matches!(
            self.status(),
            RelayStatus::Connected | RelayStatus::Authenticating
        ) {
            self.set_status(RelayStatus::Authenticated);
        }
    }

    /// Cached info document, if fresh.
    pub fn cached_info(&self) -> Option<RelayInformation> {
        let info = self.inner.info.lock();
        info.as_ref().and_then(|(doc, fetched_at)| {
            (fetched_at.elapsed() < INFO_FRESHNESS).then(|| doc.clone())
        })
    }

    /// Fetch (or return cached) relay info document.
    pub async fn ensure_info(&self) -> Result<RelayInformation, RelayError> {
        if let Some(doc) = self.cached_info() {
            return Ok(doc);
        }
        let doc = info::fetch_relay_information(&self.inner.url)
            .await
            .map_err(|e| RelayError::InfoFetch(e.to_string()))?;
        *self.inner.info.lock() = Some((doc.clone(), Instant::now()));
        Ok(doc)
    }
}
