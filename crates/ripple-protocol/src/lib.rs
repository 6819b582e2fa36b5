//! # ripple-protocol
//!
//! Wire protocol definitions for the Ripple realtime layer.
//!
//! Clients talk to the `/realtime` namespace with small JSON envelopes:
//!
//! - `subscribe` / `unsubscribe` - Table room membership
//! - `ping` / `pong` - Keepalive and latency
//! - `reconnect` - Reconnect handshake with an attempt cap
//! - `connected`, `error`, `<table>:<insert|update|delete>` - Server events
//!
//! ## Example
//!
//! ```rust
//! use ripple_protocol::{codec, ClientRequest, Envelope};
//! use serde_json::json;
//!
//! let env = Envelope::new("subscribe", json!({"tables": ["goals"]})).with_ack(1);
//! let text = codec::encode_text(&env).unwrap();
//! let decoded = codec::decode_text(&text).unwrap();
//! assert!(matches!(
//!     ClientRequest::from_envelope(&decoded),
//!     Ok(ClientRequest::Subscribe { .. })
//! ));
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, decode_text, encode, encode_text, ProtocolError};
pub use frames::{
    events, ChangePayload, ClientRequest, Connected, Envelope, ErrorEvent, Pong, ReconnectAck,
    RequestError, SubscribeAck, UnsubscribeAck,
};
