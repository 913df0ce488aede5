//! Relay wire protocol — frame vocabulary and serialization
//!
//! Frames are JSON arrays with a leading verb. Client → relay:
//! `REQ`, `CLOSE`, `EVENT`, `AUTH`. Relay → client: `EVENT`, `EOSE`,
//! `OK`, `CLOSED`, `NOTICE`, `AUTH`. A frame that fails to parse is a
//! recoverable error; the connection that produced it is unaffected.

use crate::event::{Event, EventId};
use crate::filter::Filter;
use serde_json::{json, Value};
use thiserror::Error;

/// Wire protocol error types
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Unknown verb: {0}")]
    UnknownVerb(String),
}

/// A frame sent from the client to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Open a wire subscription
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// Close a wire subscription
    Close { subscription_id: String },
    /// Publish an event
    Event { event: Event },
    /// Answer an authentication challenge with a signed event
    Auth { event: Event },
}

impl ClientFrame {
    /// Serialize to the JSON array wire form.
    pub fn to_wire(&self) -> String {
        let value = match self {
            ClientFrame::Req {
                subscription_id,
                filters,
            } => {
                let mut parts = vec![json!("REQ"), json!(subscription_id)];
                parts.extend(filters.iter().map(|f| json!(f)));
                Value::Array(parts)
            }
            ClientFrame::Close { subscription_id } => json!(["CLOSE", subscription_id]),
            ClientFrame::Event { event } => json!(["EVENT", event]),
            ClientFrame::Auth { event } => json!(["AUTH", event]),
        };
        value.to_string()
    }

    /// Parse a client frame; used by in-process test relays.
    pub fn from_wire(raw: &str) -> Result<Self, ProtocolError> {
        let parts = parse_array(raw)?;
        let verb = verb_of(&parts)?;
        match verb {
            "REQ" => {
                let subscription_id = string_at(&parts, 1)?;
                let filters = parts[2..]
                    .iter()
                    .map(|value| {
                        serde_json::from_value(value.clone())
                            .map_err(|e| ProtocolError::Malformed(e.to_string()))
                    })
                    .collect::<Result<Vec<Filter>, _>>()?;
                Ok(ClientFrame::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(ClientFrame::Close {
                subscription_id: string_at(&parts, 1)?,
            }),
            "EVENT" => Ok(ClientFrame::Event {
                event: event_at(&parts, 1)?,
            }),
            "AUTH" => Ok(ClientFrame::Auth {
                event: event_at(&parts, 1)?,
            }),
            other => Err(ProtocolError::UnknownVerb(other.to_string())),
        }
    }
}

/// A frame received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    /// An event matching one of our wire subscriptions
    Event {
        subscription_id: String,
        event: Event,
    },
    /// End of stored events for a wire subscription
    Eose { subscription_id: String },
    /// Publish acknowledgment
    Ok {
        event_id: EventId,
        accepted: bool,
        message: String,
    },
    /// Relay closed a wire subscription
    Closed {
        subscription_id: String,
        message: String,
    },
    /// Human-readable notice
    Notice { message: String },
    /// Authentication challenge
    Auth { challenge: String },
}

impl RelayFrame {
    /// Parse a relay frame from its wire form.
    pub fn from_wire(raw: &str) -> Result<Self, ProtocolError> {
        let parts = parse_array(raw)?;
        let verb = verb_of(&parts)?;
        match verb {
            "EVENT" => Ok(RelayFrame::Event {
                subscription_id: string_at(&parts, 1)?,
                event: event_at(&parts, 2)?,
            }),
            "EOSE" => Ok(RelayFrame::Eose {
                subscription_id: string_at(&parts, 1)?,
            }),
            "OK" => Ok(RelayFrame::Ok {
                event_id: string_at(&parts, 1)?,
                accepted: bool_at(&parts, 2)?,
                message: string_at(&parts, 3).unwrap_or_default(),
            }),
            "CLOSED" => Ok(RelayFrame::Closed {
                subscription_id: string_at(&parts, 1)?,
                message: string_at(&parts, 2).unwrap_or_default(),
            }),
            "NOTICE" => Ok(RelayFrame::Notice {
                message: string_at(&parts, 1)?,
            }),
            "AUTH" => Ok(RelayFrame::Auth {
                challenge: string_at(&parts, 1)?,
            }),
            other => Err(ProtocolError::UnknownVerb(other.to_string())),
        }
    }

    /// Serialize to wire form; used by in-process test relays.
    pub fn to_wire(&self) -> String {
        let value = match self {
            RelayFrame::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayFrame::Eose { subscription_id } => json!(["EOSE", subscription_id]),
            RelayFrame::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            RelayFrame::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
            RelayFrame::Notice { message } => json!(["NOTICE", message]),
            RelayFrame::Auth { challenge } => json!(["AUTH", challenge]),
        };
        value.to_string()
    }
}

fn parse_array(raw: &str) -> Result<Vec<Value>, ProtocolError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    match value {
        Value::Array(parts) if !parts.is_empty() => Ok(parts),
        Value::Array(_) => Err(ProtocolError::Malformed("empty frame".to_string())),
        _ => Err(ProtocolError::Malformed("frame is not an array".to_string())),
    }
}

fn verb_of(parts: &[Value]) -> Result<&str, ProtocolError> {
    parts[0]
        .as_str()
        .ok_or_else(|| ProtocolError::Malformed("verb is not a string".to_string()))
}

fn string_at(parts: &[Value], index: usize) -> Result<String, ProtocolError> {
    parts
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::Malformed(format!("missing string at position {index}")))
}

fn bool_at(parts: &[Value], index: usize) -> Result<bool, ProtocolError> {
    parts
        .get(index)
        .and_then(Value::as_bool)
        .ok_or_else(|| ProtocolError::Malformed(format!("missing bool at position {index}")))
}

fn event_at(parts: &[Value], index: usize) -> Result<Event, ProtocolError> {
    let value = parts
        .get(index)
        .ok_or_else(|| ProtocolError::Malformed(format!("missing event at position {index}")))?;
    serde_json::from_value(value.clone()).map_err(|e| ProtocolError::Malformed(e.to_string()))
}
