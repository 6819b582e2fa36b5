//! Change events distributed to clients.
//!
//! A [`ChangeEvent`] is built per notification (a committed domain mutation or
//! a row from the upstream change feed) and is never persisted.

use chrono::{DateTime, Utc};
use ripple_protocol::{ChangePayload, Envelope, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Which provider carried an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process socket transport.
    Local,
    /// Upstream database change feed.
    External,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::External => "external",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ProviderKind::Local),
            "external" => Ok(ProviderKind::External),
            other => Err(format!("unknown provider kind: {other}")),
        }
    }
}

/// Kind of change carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
    Custom,
}

impl ChangeType {
    /// Classify a change-feed event type. Returns `None` for anything that
    /// is not a row change.
    #[must_use]
    pub fn from_feed(event_type: &str) -> Option<Self> {
        match event_type.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeType::Insert),
            "UPDATE" => Some(ChangeType::Update),
            "DELETE" => Some(ChangeType::Delete),
            _ => None,
        }
    }

    /// Upper-case name, as sent in the `event` payload field.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "INSERT",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
            ChangeType::Custom => "CUSTOM",
        }
    }

    /// Lower-case suffix used in event names (`goals:insert`).
    #[must_use]
    pub fn suffix(&self) -> &'static str {
        match self {
            ChangeType::Insert => "insert",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
            ChangeType::Custom => "custom",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification on its way to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub change_type: ChangeType,
    /// Resource table the change belongs to.
    pub table: Option<String>,
    /// Current row (or the removed row for deletes).
    pub data: Value,
    /// Previous row for updates and deletes, when known.
    pub old_data: Option<Value>,
    /// Owning user. Events with an owner also go to that user's sockets.
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Stamped by the coordinator before delivery.
    pub provider: Option<ProviderKind>,
    /// Explicit event name for custom events.
    pub name: Option<String>,
}

impl ChangeEvent {
    /// Create a new event.
    #[must_use]
    pub fn new(change_type: ChangeType, data: Value) -> Self {
        Self {
            change_type,
            table: None,
            data,
            old_data: None,
            user_id: None,
            timestamp: Utc::now(),
            provider: None,
            name: None,
        }
    }

    /// Row inserted into `table`.
    #[must_use]
    pub fn insert(table: impl Into<String>, record: Value) -> Self {
        Self::new(ChangeType::Insert, record).with_table(table)
    }

    /// Row updated in `table`.
    #[must_use]
    pub fn update(table: impl Into<String>, record: Value, old_record: Option<Value>) -> Self {
        let mut event = Self::new(ChangeType::Update, record).with_table(table);
        event.old_data = old_record;
        event
    }

    /// Row deleted from `table`.
    #[must_use]
    pub fn delete(table: impl Into<String>, old_record: Value) -> Self {
        let mut event = Self::new(ChangeType::Delete, old_record.clone()).with_table(table);
        event.old_data = Some(old_record);
        event
    }

    /// Application-defined event, delivered under `name`.
    #[must_use]
    pub fn custom(name: impl Into<String>, data: Value) -> Self {
        let mut event = Self::new(ChangeType::Custom, data);
        event.name = Some(name.into());
        event
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Owning user, treating an empty id as absent.
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|u| !u.is_empty())
    }

    /// Name the event is emitted under, e.g. `goals:insert`.
    #[must_use]
    pub fn event_name(&self) -> String {
        if let (ChangeType::Custom, Some(name)) = (self.change_type, &self.name) {
            return name.clone();
        }
        match &self.table {
            Some(table) => format!("{}:{}", table, self.change_type.suffix()),
            None => self.change_type.suffix().to_string(),
        }
    }

    /// Client-facing payload.
    #[must_use]
    pub fn payload(&self) -> ChangePayload {
        ChangePayload {
            table: self.table.clone(),
            event: self.change_type.as_str().to_string(),
            record: self.data.clone(),
            old_record: self.old_data.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Wire envelope for this event.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        Envelope::emit(self.event_name(), &self.payload())
    }
}
