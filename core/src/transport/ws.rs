//! Websocket transport backed by tokio-tungstenite

use super::{Transport, TransportConnection, TransportError, TransportEvent};
use crate::relay::RelayUrl;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

const OUTGOING_BUFFER: usize = 64;
const INCOMING_BUFFER: usize = 1024;

/// Production transport: one websocket per relay connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &RelayUrl) -> Result<TransportConnection, TransportError> {
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(OUTGOING_BUFFER);
        let (incoming_tx, incoming_rx) = mpsc::channel::<TransportEvent>(INCOMING_BUFFER);

        let writer_url = url.clone();
        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    debug!(url = %writer_url, error = %e, "websocket send failed");
                    break;
                }
            }
            // sender side dropped or send failed: close the socket
            let _ = sink.close().await;
        });

        let reader_url = url.clone();
        tokio::spawn(async move {
            loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if incoming_tx.send(TransportEvent::Frame(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string());
                        let _ = incoming_tx.send(TransportEvent::Closed { reason }).await;
                        break;
                    }
                    // pings are answered by tungstenite during reads
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(url = %reader_url, error = %e, "websocket read failed");
                        let _ = incoming_tx.send(TransportEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = incoming_tx.send(TransportEvent::Closed { reason: None }).await;
                        break;
                    }
                }
            }
        });

        Ok(TransportConnection {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}
