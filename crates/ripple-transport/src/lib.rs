//! # ripple-transport
//!
//! Realtime providers and the client-facing gateway for Ripple.
//!
//! - **LocalProvider** - Fan-out over the gateway's own rooms
//! - **ExternalChangeProvider** - Postgres change feed over Phoenix channels
//! - **Coordinator** - Active-provider routing with failover
//! - **Gateway** - Per-connection protocol state machine
//!
//! ## Delivery paths
//!
//! Every event reaches local sockets through exactly one path:
//!
//! ```text
//! local active:     Coordinator::broadcast ─▶ LocalProvider ─▶ BroadcastRouter
//! external active:  Coordinator::broadcast ─▶ ExternalChangeProvider (upstream)
//!                                          └▶ BroadcastRouter
//! upstream rows:    PhoenixFeed ─▶ ExternalChangeProvider ─▶ change pump ─▶ BroadcastRouter
//! ```
//!
//! ```rust,ignore
//! use ripple_transport::{Gateway, Session};
//!
//! let mut session = Session::new(socket_id);
//! gateway.connect(&mut session, token.as_deref(), sender).await?;
//! while let Some(envelope) = next_envelope().await {
//!     if gateway.handle(&mut session, envelope).await == Disposition::Close {
//!         break;
//!     }
//! }
//! gateway.disconnect(&mut session).await;
//! ```

pub mod coordinator;
pub mod external;
pub mod feed;
pub mod gateway;
pub mod local;
pub mod phoenix;
pub mod traits;

#[cfg(test)]
mod testing;

pub use coordinator::{Coordinator, CoordinatorError, CoordinatorStatus, TrackedConnection};
pub use external::ExternalChangeProvider;
pub use feed::{ChangeFeed, ChannelState, FeedChannel, RowChange};
pub use gateway::{Disposition, Gateway, GatewayConfig, GatewayError, Session};
pub use local::LocalProvider;
pub use phoenix::{PhoenixConfig, PhoenixFeed};
pub use traits::{ProviderError, RealtimeProvider};
