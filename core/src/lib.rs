//! Tangle core — relay connectivity and subscriptions
//!
//! Client-side core for a relay-based pub/sub network: per-relay
//! connection lifecycle with quadratic backoff, a subscription
//! registry that groups and dedups queries, outbox-model relay
//! selection from per-author write-relay advertisements, and
//! concurrent publish with partial-result reporting.
//!
//! The [`Client`] façade wires everything together; every piece is
//! also usable on its own with an injected [`transport::Transport`].

pub mod cache;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod filter;
pub mod outbox;
pub mod protocol;
pub mod publish;
pub mod relay;
pub mod subscription;
pub mod transport;

pub use cache::{CacheAdapter, MemoryCache};
pub use client::{Client, ClientBuilder, LiveRelayListSource};
pub use config::{ClientConfig, ConnectivityConfig};
pub use dispatch::{DispatchError, DispatchQueue};
pub use event::{AuthorId, Event, EventId};
pub use filter::Filter;
pub use outbox::{OutboxTracker, RelayList, RelayListSource, StaticRelayListSource};
pub use publish::{PublishError, PublishReport};
pub use relay::{
    ConnectionStats, PoolEvent, PoolStats, Relay, RelayEvent, RelayPool, RelayStatus, RelayUrl,
};
pub use subscription::{
    CacheUsage, SubscriptionHandle, SubscriptionManager, SubscriptionOptions, SubscriptionState,
    SubscriptionUpdate,
};
