//! External change-feed provider.
//!
//! Keeps exactly one upstream channel per table while at least one user is
//! subscribed to it. Row changes from every channel are turned into
//! [`ChangeEvent`]s tagged with their owning user and handed to the
//! coordinator through an mpsc channel; this provider never emits to
//! sockets itself.

use async_trait::async_trait;
use dashmap::DashMap;
use ripple_core::{ChangeEvent, ChangeType, ProviderKind};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::feed::{ChangeFeed, ChannelState, RowChange};
use crate::traits::{ProviderError, RealtimeProvider};

/// Default row field naming the owning user.
pub const DEFAULT_OWNER_FIELD: &str = "user_id";

/// Alternate spelling accepted for the owner field.
const ALT_OWNER_FIELD: &str = "userId";

struct TableChannel {
    subscribers: HashSet<String>,
    pump: JoinHandle<()>,
}

/// What a subscribe call did to one table.
enum Membership {
    Opened,
    Added,
    Held,
}

/// Provider backed by an upstream change feed.
pub struct ExternalChangeProvider {
    feed: Arc<dyn ChangeFeed>,
    channels: Mutex<HashMap<String, TableChannel>>,
    states: DashMap<String, watch::Receiver<ChannelState>>,
    events: mpsc::UnboundedSender<ChangeEvent>,
    owner_field: String,
}

impl ExternalChangeProvider {
    /// Create a provider over `feed`.
    ///
    /// The returned receiver yields every owned row change from every open
    /// channel.
    pub fn new(feed: Arc<dyn ChangeFeed>) -> (Self, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let provider = Self {
            feed,
            channels: Mutex::new(HashMap::new()),
            states: DashMap::new(),
            events,
            owner_field: DEFAULT_OWNER_FIELD.to_string(),
        };
        (provider, rx)
    }

    /// Use a different row field as the owner.
    #[must_use]
    pub fn with_owner_field(mut self, field: impl Into<String>) -> Self {
        self.owner_field = field.into();
        self
    }

    /// Tables with an open upstream channel.
    pub async fn open_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.channels.lock().await.keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Users holding the channel of `table`.
    pub async fn table_users(&self, table: &str) -> Vec<String> {
        let channels = self.channels.lock().await;
        let mut users: Vec<String> = channels
            .get(table)
            .map(|c| c.subscribers.iter().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Current state of a table channel.
    pub fn channel_state(&self, table: &str) -> Option<ChannelState> {
        self.states.get(table).map(|s| *s.borrow())
    }

    /// Close every upstream channel.
    pub async fn shutdown(&self) {
        let mut channels = self.channels.lock().await;
        for (table, channel) in channels.drain() {
            self.close_channel(&table, channel).await;
        }
        info!(feed = self.feed.name(), "External provider shut down");
    }

    fn is_dead(&self, table: &str) -> bool {
        matches!(
            self.channel_state(table),
            Some(ChannelState::Errored | ChannelState::Closed)
        )
    }

    async fn open_channel(&self, table: &str) -> Result<JoinHandle<()>, ProviderError> {
        let opened = self.feed.open(table).await?;
        let pump = self.spawn_pump(table.to_string(), opened.rows);
        self.states.insert(table.to_string(), opened.state);
        Ok(pump)
    }

    async fn close_channel(&self, table: &str, channel: TableChannel) {
        channel.pump.abort();
        self.states.remove(table);
        if let Err(e) = self.feed.close(table).await {
            warn!(table = %table, error = %e, "Failed to close upstream channel");
        }
    }

    /// Replace an errored or closed channel, keeping its subscribers.
    async fn reopen(&self, table: &str, channel: &mut TableChannel) -> Result<(), ProviderError> {
        channel.pump.abort();
        if let Err(e) = self.feed.close(table).await {
            debug!(table = %table, error = %e, "Failed to close dead upstream channel");
        }
        channel.pump = self.open_channel(table).await?;
        info!(
            table = %table,
            subscribers = channel.subscribers.len(),
            "Reopened upstream channel"
        );
        Ok(())
    }

    async fn join_table(
        &self,
        channels: &mut HashMap<String, TableChannel>,
        user_id: &str,
        table: &str,
    ) -> Result<Membership, ProviderError> {
        if let Some(channel) = channels.get_mut(table) {
            if self.is_dead(table) {
                self.reopen(table, channel).await?;
            }
            return Ok(if channel.subscribers.insert(user_id.to_string()) {
                Membership::Added
            } else {
                Membership::Held
            });
        }

        let pump = self.open_channel(table).await?;
        channels.insert(
            table.to_string(),
            TableChannel {
                subscribers: HashSet::from([user_id.to_string()]),
                pump,
            },
        );
        info!(table = %table, feed = self.feed.name(), "Opened upstream channel");
        Ok(Membership::Opened)
    }

    /// Undo a partially applied subscribe.
    async fn roll_back(
        &self,
        channels: &mut HashMap<String, TableChannel>,
        user_id: &str,
        opened: &[String],
        added: &[String],
    ) {
        for table in added {
            if let Some(channel) = channels.get_mut(table) {
                channel.subscribers.remove(user_id);
            }
        }
        for table in opened {
            if let Some(channel) = channels.remove(table) {
                self.close_channel(table, channel).await;
            }
        }
    }

    fn spawn_pump(
        &self,
        table: String,
        mut rows: mpsc::UnboundedReceiver<RowChange>,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        let owner_field = self.owner_field.clone();

        tokio::spawn(async move {
            while let Some(row) = rows.recv().await {
                let Some(event) = classify(&table, row, &owner_field) else {
                    continue;
                };
                if events.send(event).is_err() {
                    debug!(table = %table, "Change consumer gone, stopping pump");
                    break;
                }
            }
            trace!(table = %table, "Row pump finished");
        })
    }
}

/// Turn a row change into an owned change event.
///
/// Rows with an unknown event type or without an owner are dropped.
pub fn classify(table: &str, row: RowChange, owner_field: &str) -> Option<ChangeEvent> {
    let Some(change_type) = ChangeType::from_feed(&row.event_type) else {
        debug!(table = %table, event_type = %row.event_type, "Ignoring unknown row event");
        return None;
    };

    let owner = owner_of(row.new.as_ref(), owner_field)
        .or_else(|| owner_of(row.old.as_ref(), owner_field));
    let Some(user_id) = owner else {
        debug!(table = %table, "Dropping row without owner");
        return None;
    };

    let event = match change_type {
        ChangeType::Insert => ChangeEvent::insert(table, row.new.unwrap_or(Value::Null)),
        ChangeType::Update => ChangeEvent::update(
            table,
            row.new.unwrap_or(Value::Null),
            row.old.filter(|old| !is_empty_object(old)),
        ),
        ChangeType::Delete => ChangeEvent::delete(table, row.old.unwrap_or(Value::Null)),
        ChangeType::Custom => return None,
    };

    Some(event.with_user(user_id))
}

fn owner_of(row: Option<&Value>, field: &str) -> Option<String> {
    let row = row?;
    let value = row.get(field).or_else(|| row.get(ALT_OWNER_FIELD))?;
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(|o| o.is_empty())
}

#[async_trait]
impl RealtimeProvider for ExternalChangeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::External
    }

    async fn connect(&self, user_id: &str, connection_id: &str) -> Result<(), ProviderError> {
        trace!(user = %user_id, connection = %connection_id, "External connect");
        Ok(())
    }

    async fn disconnect(&self, connection_id: &str) -> Result<(), ProviderError> {
        trace!(connection = %connection_id, "External disconnect");
        Ok(())
    }

    async fn subscribe(&self, user_id: &str, tables: &[String]) -> Result<(), ProviderError> {
        let mut channels = self.channels.lock().await;
        let mut opened = Vec::new();
        let mut added = Vec::new();

        for table in tables {
            match self.join_table(&mut channels, user_id, table).await {
                Ok(Membership::Opened) => opened.push(table.clone()),
                Ok(Membership::Added) => added.push(table.clone()),
                Ok(Membership::Held) => {}
                Err(e) => {
                    self.roll_back(&mut channels, user_id, &opened, &added).await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    async fn unsubscribe(&self, user_id: &str, tables: &[String]) -> Result<(), ProviderError> {
        let mut channels = self.channels.lock().await;

        for table in tables {
            let Some(channel) = channels.get_mut(table) else {
                continue;
            };
            channel.subscribers.remove(user_id);
            if !channel.subscribers.is_empty() {
                continue;
            }

            if let Some(channel) = channels.remove(table) {
                self.close_channel(table, channel).await;
            }
            info!(table = %table, "Closed upstream channel");
        }

        Ok(())
    }

    async fn broadcast(&self, event: &ChangeEvent) -> Result<(), ProviderError> {
        let Some(table) = event.table.as_deref() else {
            trace!(event = %event.event_name(), "No table for upstream broadcast");
            return Ok(());
        };
        if !self.states.contains_key(table) {
            trace!(table = %table, "No open channel for upstream broadcast");
            return Ok(());
        }

        let payload = serde_json::to_value(event.payload())
            .map_err(|e| ProviderError::Other(e.to_string()))?;
        self.feed.broadcast(table, &event.event_name(), payload).await
    }

    fn is_healthy(&self) -> bool {
        self.states
            .iter()
            .any(|state| *state.borrow() == ChannelState::Joined)
    }
}
