//! Provider abstraction for Ripple.
//!
//! A provider is one way of getting events to clients. The coordinator
//! holds one active provider and fails over to the other, so both
//! implementations must honour the same contract.

use async_trait::async_trait;
use ripple_core::{ChangeEvent, ProviderKind};
use thiserror::Error;

/// Provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider cannot serve requests right now.
    #[error("Provider {0} is unhealthy")]
    Unhealthy(ProviderKind),

    /// The upstream connection could not be used.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// An upstream channel could not be opened or used.
    #[error("Channel error on {table}: {message}")]
    Channel { table: String, message: String },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A realtime transport provider.
#[async_trait]
pub trait RealtimeProvider: Send + Sync {
    /// Which provider this is.
    fn kind(&self) -> ProviderKind;

    /// A user's connection came up.
    async fn connect(&self, user_id: &str, connection_id: &str) -> Result<(), ProviderError>;

    /// A connection went away.
    async fn disconnect(&self, connection_id: &str) -> Result<(), ProviderError>;

    /// A user wants changes of `tables`.
    async fn subscribe(&self, user_id: &str, tables: &[String]) -> Result<(), ProviderError>;

    /// A user no longer wants changes of `tables`.
    async fn unsubscribe(&self, user_id: &str, tables: &[String]) -> Result<(), ProviderError>;

    /// Deliver an event.
    async fn broadcast(&self, event: &ChangeEvent) -> Result<(), ProviderError>;

    /// Check if the provider is healthy. Computed on demand.
    fn is_healthy(&self) -> bool;
}
