//! Publishing events to a relay set
//!
//! Sends to every relay concurrently under one deadline and reports
//! who acknowledged. Partial coverage is a result, not an error — the
//! publish only fails when a requested minimum acknowledgment count is
//! not met.

use crate::event::Event;
use crate::relay::pool::RelayPool;
use crate::relay::RelayUrl;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of one publish across a relay set.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    /// Relays that accepted the event, in completion order
    pub acked: Vec<RelayUrl>,
    /// Relays that rejected, timed out, or could not be reached
    pub failed: Vec<(RelayUrl, String)>,
    /// The minimum acknowledgment count the caller asked for
    pub required: usize,
}

impl PublishReport {
    pub fn ack_count(&self) -> usize {
        self.acked.len()
    }
}

/// Publish error types
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("publish acknowledged by {} of {} required relays", report.ack_count(), report.required)]
    RequiredAcksNotMet { report: PublishReport },
}

/// Send `event` to every relay in `relays` concurrently, resolving
/// once all have answered or `timeout` elapses. Disconnected relays
/// are asked to connect first; failing to connect in time just keeps
/// them out of the acknowledged set. Re-publishing the same event is
/// always permitted.
pub async fn publish_to_set(
    pool: &RelayPool,
    event: &Event,
    relays: &[RelayUrl],
    timeout: Duration,
    required_acks: usize,
) -> Result<PublishReport, PublishError> {
    let deadline = Instant::now() + timeout;

    let attempts = relays.iter().map(|url| {
        let url = url.clone();
        let relay = pool.get_relay(&url, true, true);
        let event = event.clone();
        async move {
            let Some(relay) = relay else {
                return (url, Err("relay is blacklisted".to_string()));
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !relay.wait_for_connected(remaining).await {
                return (url, Err("relay did not connect in time".to_string()));
            }
            let receiver = match relay.publish(&event).await {
                Ok(receiver) => receiver,
                Err(e) => return (url, Err(e.to_string())),
            };
            match tokio::time::timeout_at(deadline, receiver).await {
                Ok(Ok(ack)) if ack.accepted => (url, Ok(())),
                Ok(Ok(ack)) => (url, Err(ack.message)),
                Ok(Err(_)) => (url, Err("connection closed before ack".to_string())),
                Err(_) => (url, Err("timed out waiting for ack".to_string())),
            }
        }
    });

    let mut report = PublishReport {
        required: required_acks,
        ..PublishReport::default()
    };
    for (url, outcome) in futures::future::join_all(attempts).await {
        match outcome {
            Ok(()) => report.acked.push(url),
            Err(reason) => {
                debug!(relay = %url, %reason, event = %event.id, "publish not acknowledged");
                report.failed.push((url, reason));
            }
        }
    }

    if required_acks > 0 && report.ack_count() < required_acks {
        return Err(PublishError::RequiredAcksNotMet { report });
    }
    Ok(report)
}
