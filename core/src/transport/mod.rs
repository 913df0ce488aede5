//! Transport abstraction for relay connections
//!
//! A transport produces, per connect, a sink of raw text frames and a
//! stream of transport events. Anything that can satisfy that shape can
//! back a relay connection; the production implementation speaks
//! websockets, tests use an in-process channel transport.

pub mod memory;
pub mod ws;

pub use memory::{AckMode, MemoryTransport};
pub use ws::WebSocketTransport;

use crate::relay::RelayUrl;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport error types
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Relay unreachable: {0}")]
    Unreachable(RelayUrl),
}

/// Events surfaced by an open transport connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A complete text frame arrived
    Frame(String),
    /// The peer closed the connection
    Closed { reason: Option<String> },
    /// The connection failed; terminal, a `Closed` may not follow
    Error(String),
}

/// One open connection: a frame sink and an event stream.
///
/// Dropping `outgoing` closes the connection from our side.
pub struct TransportConnection {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<TransportEvent>,
}

/// A connector for relay endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `url`. Resolves once the transport is open
    /// and frames can be sent.
    async fn connect(&self, url: &RelayUrl) -> Result<TransportConnection, TransportError>;
}
