//! Local-transport provider.
//!
//! Delivers over the gateway's own rooms. Room membership is owned by the
//! gateway, so subscription calls have nothing to do here.

use async_trait::async_trait;
use ripple_core::{BroadcastRouter, ChangeEvent, ProviderKind};
use tracing::trace;

use crate::traits::{ProviderError, RealtimeProvider};

/// Provider that fans events out to locally attached sockets.
pub struct LocalProvider {
    router: BroadcastRouter,
}

impl LocalProvider {
    /// Create a provider on top of the broadcast router.
    #[must_use]
    pub fn new(router: BroadcastRouter) -> Self {
        Self { router }
    }
}

#[async_trait]
impl RealtimeProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn connect(&self, user_id: &str, connection_id: &str) -> Result<(), ProviderError> {
        trace!(user = %user_id, connection = %connection_id, "Local connect");
        Ok(())
    }

    async fn disconnect(&self, connection_id: &str) -> Result<(), ProviderError> {
        trace!(connection = %connection_id, "Local disconnect");
        Ok(())
    }

    async fn subscribe(&self, _user_id: &str, _tables: &[String]) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn unsubscribe(&self, _user_id: &str, _tables: &[String]) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn broadcast(&self, event: &ChangeEvent) -> Result<(), ProviderError> {
        if !self.is_healthy() {
            return Err(ProviderError::Unhealthy(ProviderKind::Local));
        }
        self.router.dispatch(event).await;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.router.rooms().is_open()
    }
}
