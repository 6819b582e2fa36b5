//! # ripple-core
//!
//! Core types and state for the Ripple realtime layer.
//!
//! This crate provides the building blocks the transport layer is made of:
//!
//! - **ChangeEvent** - Database-change and custom events
//! - **Registry** - TTL-backed socket/user and socket/table mapping
//! - **Rooms** - Local socket groups events are emitted to
//! - **BroadcastRouter** - Fan-out by owning user and by table
//! - **TokenVerifier** - Identity extraction for new connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌─────────────┐
//! │ ChangeEvent │────▶│ BroadcastRouter  │────▶│   Rooms     │──▶ sockets
//! └─────────────┘     └──────────────────┘     └─────────────┘
//!                              │
//!                              ▼
//!                     ┌──────────────────┐     ┌──────────────┐
//!                     │    Registry      │────▶│ SessionStore │
//!                     └──────────────────┘     └──────────────┘
//! ```

pub mod auth;
pub mod broadcast;
pub mod event;
pub mod registry;
pub mod rooms;
pub mod store;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use auth::{AuthError, Identity, JwtVerifier, TokenVerifier};
pub use broadcast::BroadcastRouter;
pub use event::{ChangeEvent, ChangeType, ProviderKind};
pub use registry::{ConnectionRecord, Registry, RegistryConfig};
pub use rooms::{Rooms, SocketId, SocketSender, TransportError};
pub use store::{MemoryStore, SessionStore, StoreError};

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
