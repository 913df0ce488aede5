//! Client configuration
//!
//! Every timing knob in the client lives here so tests can shrink them
//! and embedders can tune them. Defaults match typical relay behavior.

use crate::relay::RelayUrl;
use std::time::Duration;

/// Per-relay connection lifecycle knobs.
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// Base of the quadratic reconnect backoff
    pub reconnect_base_delay: Duration,
    /// Backoff ceiling
    pub max_reconnect_delay: Duration,
    /// A connection held at least this long resets the backoff
    pub sustained_threshold: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30 * 60),
            sustained_threshold: Duration::from_secs(30),
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relays the client always keeps in the pool
    pub explicit_relays: Vec<RelayUrl>,
    /// Relays the pool refuses to create
    pub blacklisted_relays: Vec<RelayUrl>,
    pub connectivity: ConnectivityConfig,
    /// Deadline for `connect()` across the pool
    pub connect_timeout: Duration,
    /// Default deadline for publish acknowledgments
    pub publish_timeout: Duration,
    /// Deadline for cache adapter answers
    pub cache_timeout: Duration,
    /// How long groupable subscriptions wait to coalesce
    pub groupable_delay: Duration,
    /// Quiet period after the last relay's EOSE before a
    /// subscription is marked end-of-stored-events
    pub eose_settle_delay: Duration,
    /// Lease for relays added temporarily for a single query
    pub temporary_relay_ttl: Duration,
    /// Bound on the seen-events ledger
    pub seen_events_capacity: usize,
    /// Concurrent relay-list fetches in the outbox tracker
    pub outbox_concurrency: usize,
    /// How many explicit relays a selection falls back to when an
    /// author's relay list is unknown
    pub fallback_relay_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            explicit_relays: Vec::new(),
            blacklisted_relays: Vec::new(),
            connectivity: ConnectivityConfig::default(),
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            cache_timeout: Duration::from_secs(1),
            groupable_delay: Duration::from_millis(100),
            eose_settle_delay: Duration::from_millis(500),
            temporary_relay_ttl: Duration::from_secs(30),
            seen_events_capacity: 4096,
            outbox_concurrency: 4,
            fallback_relay_limit: 5,
        }
    }
}
