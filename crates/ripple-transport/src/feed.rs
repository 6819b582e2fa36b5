//! Upstream change-feed abstraction.
//!
//! A change feed hands out one channel per table. Each channel yields raw
//! row changes and reports its lifecycle through a `watch` so health can be
//! read synchronously.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::traits::ProviderError;

/// Lifecycle of an upstream table channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Joining,
    Joined,
    Closed,
    Errored,
}

/// A raw row change as the upstream reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowChange {
    /// `INSERT`, `UPDATE` or `DELETE`.
    pub event_type: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl RowChange {
    pub fn new(event_type: impl Into<String>, new: Option<Value>, old: Option<Value>) -> Self {
        Self {
            event_type: event_type.into(),
            new,
            old,
        }
    }
}

/// An open upstream channel for one table.
#[derive(Debug)]
pub struct FeedChannel {
    pub table: String,
    pub rows: mpsc::UnboundedReceiver<RowChange>,
    pub state: watch::Receiver<ChannelState>,
}

/// A source of per-table row changes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open the channel for `table`.
    async fn open(&self, table: &str) -> Result<FeedChannel, ProviderError>;

    /// Close the channel for `table`. Closing an unknown table is a no-op.
    async fn close(&self, table: &str) -> Result<(), ProviderError>;

    /// Publish a named event on the channel of `table`.
    async fn broadcast(&self, table: &str, event: &str, payload: Value) -> Result<(), ProviderError>;

    /// Feed name, for logging.
    fn name(&self) -> &'static str;
}
