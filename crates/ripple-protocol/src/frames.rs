//! Message types for the Ripple socket protocol.
//!
//! Every message on the wire is an [`Envelope`]: an event name, a JSON
//! payload and an optional acknowledgement id. Requests coming from clients
//! are parsed into [`ClientRequest`]; everything the server sends is built
//! from the payload structs in this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;

/// Event names used by the protocol.
pub mod events {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const RECONNECT: &str = "reconnect";
    pub const CONNECTED: &str = "connected";
    pub const ERROR: &str = "error";
    pub const ACK: &str = "ack";
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name, e.g. `subscribe` or `goals:insert`.
    pub event: String,

    /// Event payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    /// Acknowledgement id. Requests that carry one get their response as an
    /// `ack` envelope with the same id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl Envelope {
    /// Create an envelope without acknowledgement id.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            ack: None,
        }
    }

    /// Attach an acknowledgement id.
    #[must_use]
    pub fn with_ack(mut self, id: u64) -> Self {
        self.ack = Some(id);
        self
    }

    /// Build an outbound event from any serializable payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn emit<T: Serialize>(event: impl Into<String>, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(event, serde_json::to_value(payload)?))
    }

    /// Build the response to `request`.
    ///
    /// Acknowledged requests are answered with an `ack` envelope, anything
    /// else is answered under the request's own event name.
    #[must_use]
    pub fn reply_to(request: &Envelope, data: Value) -> Self {
        match request.ack {
            Some(id) => Self::new(events::ACK, data).with_ack(id),
            None => Self::new(request.event.clone(), data),
        }
    }
}

/// A request sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Join the rooms of the given tables.
    Subscribe { tables: Vec<String> },
    /// Leave the rooms of the given tables.
    Unsubscribe { tables: Vec<String> },
    /// Keepalive. The optional timestamp is in unix milliseconds.
    Ping { timestamp: Option<i64> },
    /// Client-driven reconnect handshake.
    Reconnect,
}

#[derive(Debug, Default, Deserialize)]
struct TablesPayload {
    #[serde(default)]
    tables: Vec<String>,
}

impl ClientRequest {
    /// Parse a request out of an inbound envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownEvent`] for events clients may not
    /// send and [`ProtocolError::Json`] for malformed payloads.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        match envelope.event.as_str() {
            events::SUBSCRIBE => Ok(ClientRequest::Subscribe {
                tables: parse_tables(&envelope.data)?,
            }),
            events::UNSUBSCRIBE => Ok(ClientRequest::Unsubscribe {
                tables: parse_tables(&envelope.data)?,
            }),
            events::PING => Ok(ClientRequest::Ping {
                timestamp: envelope.data.get("timestamp").and_then(Value::as_i64),
            }),
            events::RECONNECT => Ok(ClientRequest::Reconnect),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    /// The event name of this request.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientRequest::Subscribe { .. } => events::SUBSCRIBE,
            ClientRequest::Unsubscribe { .. } => events::UNSUBSCRIBE,
            ClientRequest::Ping { .. } => events::PING,
            ClientRequest::Reconnect => events::RECONNECT,
        }
    }
}

fn parse_tables(data: &Value) -> Result<Vec<String>, ProtocolError> {
    if data.is_null() {
        return Ok(Vec::new());
    }
    let payload: TablesPayload = serde_json::from_value(data.clone())?;
    Ok(payload.tables)
}

/// Sent once after a connection is authenticated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Out-of-band error notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}

/// Response payload for a failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestError {
    pub error: String,
}

/// Response payload for `subscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAck {
    pub success: bool,
    pub subscribed_tables: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Response payload for `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeAck {
    pub success: bool,
    pub unsubscribed_tables: Vec<String>,
    pub remaining_tables: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Response payload for `reconnect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectAck {
    pub success: bool,
    pub message: String,
    pub attempt: u32,
}

/// Keepalive response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: DateTime<Utc>,
    /// Milliseconds between the client's ping timestamp and the server clock.
    pub latency: i64,
}

/// Payload of a `<table>:<operation>` change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Upper-case change type (`INSERT`, `UPDATE`, `DELETE`, `CUSTOM`).
    pub event: String,
    pub record: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Value>,
    pub timestamp: DateTime<Utc>,
}
