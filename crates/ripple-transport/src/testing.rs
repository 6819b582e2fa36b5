//! Test doubles for providers and change feeds.

use async_trait::async_trait;
use dashmap::DashMap;
use ripple_core::{ChangeEvent, Identity, ProviderKind, TokenVerifier};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};

use crate::feed::{ChangeFeed, ChannelState, FeedChannel, RowChange};
use crate::traits::{ProviderError, RealtimeProvider};

/// In-process change feed. Channels join immediately.
pub struct MemoryFeed {
    channels: DashMap<String, (mpsc::UnboundedSender<RowChange>, watch::Sender<ChannelState>)>,
    opens: DashMap<String, usize>,
    closed: Mutex<Vec<String>>,
    broadcasts: Mutex<Vec<(String, String)>>,
    fail_opens: AtomicBool,
    refused: Mutex<HashSet<String>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            opens: DashMap::new(),
            closed: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            fail_opens: AtomicBool::new(false),
            refused: Mutex::new(HashSet::new()),
        }
    }

    pub fn push(&self, table: &str, row: RowChange) {
        if let Some(channel) = self.channels.get(table) {
            let _ = channel.0.send(row);
        }
    }

    pub fn set_state(&self, table: &str, state: ChannelState) {
        if let Some(channel) = self.channels.get(table) {
            channel.1.send_replace(state);
        }
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    /// Refuse joins for one table only.
    pub fn refuse(&self, table: &str) {
        self.refused.lock().unwrap().insert(table.to_string());
    }

    pub fn open_count(&self, table: &str) -> usize {
        self.opens.get(table).map(|c| *c).unwrap_or(0)
    }

    pub fn was_closed(&self, table: &str) -> bool {
        self.closed.lock().unwrap().iter().any(|t| t == table)
    }

    pub fn broadcasts(&self) -> Vec<(String, String)> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn open(&self, table: &str) -> Result<FeedChannel, ProviderError> {
        if self.fail_opens.load(Ordering::SeqCst) || self.refused.lock().unwrap().contains(table) {
            return Err(ProviderError::Channel {
                table: table.to_string(),
                message: "join refused".into(),
            });
        }

        let (rows_tx, rows) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ChannelState::Joined);
        self.channels.insert(table.to_string(), (rows_tx, state_tx));
        *self.opens.entry(table.to_string()).or_insert(0) += 1;

        Ok(FeedChannel {
            table: table.to_string(),
            rows,
            state,
        })
    }

    async fn close(&self, table: &str) -> Result<(), ProviderError> {
        if let Some((_, (_, state))) = self.channels.remove(table) {
            state.send_replace(ChannelState::Closed);
        }
        self.closed.lock().unwrap().push(table.to_string());
        Ok(())
    }

    async fn broadcast(&self, table: &str, event: &str, _payload: Value) -> Result<(), ProviderError> {
        self.broadcasts
            .lock()
            .unwrap()
            .push((table.to_string(), event.to_string()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Scriptable provider that records every call.
pub struct MockProvider {
    kind: ProviderKind,
    healthy: AtomicBool,
    failing: AtomicBool,
    calls: Mutex<Vec<String>>,
    broadcasts: Mutex<Vec<ChangeEvent>>,
}

impl MockProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            healthy: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make every operation fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn broadcasts(&self) -> Vec<ChangeEvent> {
        self.broadcasts.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<(), ProviderError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Other(format!("{call} failed")));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl RealtimeProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn connect(&self, user_id: &str, connection_id: &str) -> Result<(), ProviderError> {
        self.record(format!("connect:{user_id}:{connection_id}"))
    }

    async fn disconnect(&self, connection_id: &str) -> Result<(), ProviderError> {
        self.record(format!("disconnect:{connection_id}"))
    }

    async fn subscribe(&self, user_id: &str, tables: &[String]) -> Result<(), ProviderError> {
        self.record(format!("subscribe:{user_id}:{}", tables.join(",")))
    }

    async fn unsubscribe(&self, user_id: &str, tables: &[String]) -> Result<(), ProviderError> {
        self.record(format!("unsubscribe:{user_id}:{}", tables.join(",")))
    }

    async fn broadcast(&self, event: &ChangeEvent) -> Result<(), ProviderError> {
        self.record(format!("broadcast:{}", event.event_name()))?;
        self.broadcasts.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Verifier with a fixed token table.
pub struct StaticVerifier {
    tokens: HashMap<String, String>,
}

impl StaticVerifier {
    /// `pairs` maps token to user id.
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            tokens: pairs
                .iter()
                .map(|(token, user)| (token.to_string(), user.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).map(|user_id| Identity {
            user_id: user_id.clone(),
            email: None,
        })
    }
}
