//! Phoenix-channels change feed.
//!
//! Speaks the Phoenix v1 JSON protocol used by Postgres change-data-capture
//! services: one `realtime:{schema}:{table}` topic per table, joined with a
//! `postgres_changes` filter, plus a socket-level heartbeat.
//!
//! The socket is not re-dialled. Once it drops every channel reports
//! [`ChannelState::Errored`], the provider goes unhealthy and the
//! coordinator moves traffic elsewhere.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::feed::{ChangeFeed, ChannelState, FeedChannel, RowChange};
use crate::traits::ProviderError;

const PHOENIX_TOPIC: &str = "phoenix";

/// Connection settings for a Phoenix change feed.
#[derive(Debug, Clone)]
pub struct PhoenixConfig {
    /// Base realtime URL, e.g. `wss://host/realtime/v1`.
    pub url: String,
    pub api_key: String,
    /// Database schema the tables live in.
    pub schema: String,
    pub heartbeat_interval: Duration,
    /// Token forwarded on join for row-level security.
    pub access_token: Option<String>,
}

impl Default for PhoenixConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            schema: "public".into(),
            heartbeat_interval: Duration::from_secs(25),
            access_token: None,
        }
    }
}

impl PhoenixConfig {
    /// Websocket endpoint for this configuration.
    #[must_use]
    pub fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/websocket?apikey={}&vsn=1.0.0", self.api_key)
    }

    fn topic(&self, table: &str) -> String {
        format!("realtime:{}:{}", self.schema, table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

struct Topic {
    join_ref: String,
    rows: mpsc::UnboundedSender<RowChange>,
    state: watch::Sender<ChannelState>,
}

/// Change feed over a Phoenix websocket.
pub struct PhoenixFeed {
    config: PhoenixConfig,
    outbound: mpsc::UnboundedSender<PhoenixMessage>,
    topics: Arc<DashMap<String, Topic>>,
    connected: Arc<AtomicBool>,
    refs: Arc<AtomicU64>,
    tasks: Vec<JoinHandle<()>>,
}

impl PhoenixFeed {
    /// Dial the upstream and start the socket tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the websocket handshake fails.
    pub async fn connect(config: PhoenixConfig) -> Result<Self, ProviderError> {
        let endpoint = config.endpoint();
        let (ws, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;
        info!(url = %config.url, "Connected to upstream change feed");

        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<PhoenixMessage>();
        let topics: Arc<DashMap<String, Topic>> = Arc::new(DashMap::new());
        let connected = Arc::new(AtomicBool::new(true));
        let refs = Arc::new(AtomicU64::new(1));

        let writer_connected = connected.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode upstream message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "Upstream write failed");
                    break;
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
        });

        let reader_topics = topics.clone();
        let reader_connected = connected.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<PhoenixMessage>(&text) {
                        Ok(message) => route(&reader_topics, message),
                        Err(e) => debug!(error = %e, "Ignoring malformed upstream message"),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("Upstream closed the socket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Upstream read failed");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            for topic in reader_topics.iter() {
                topic.state.send_replace(ChannelState::Errored);
            }
        });

        let heartbeat_tx = outbound.clone();
        let heartbeat_refs = refs.clone();
        let interval = config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reference = heartbeat_refs.fetch_add(1, Ordering::Relaxed).to_string();
                let message = PhoenixMessage {
                    topic: PHOENIX_TOPIC.into(),
                    event: "heartbeat".into(),
                    payload: json!({}),
                    reference: Some(reference),
                };
                if heartbeat_tx.send(message).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            config,
            outbound,
            topics,
            connected,
            refs,
            tasks: vec![writer, reader, heartbeat],
        })
    }

    /// Whether the upstream socket is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn send(&self, message: PhoenixMessage) -> Result<(), ProviderError> {
        self.outbound
            .send(message)
            .map_err(|_| ProviderError::Connection("upstream writer stopped".into()))
    }

    fn join_payload(&self, table: &str) -> Value {
        let mut payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "*", "schema": self.config.schema, "table": table }
                ],
            }
        });
        if let Some(token) = &self.config.access_token {
            payload["access_token"] = json!(token);
        }
        payload
    }
}

impl Drop for PhoenixFeed {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn route(topics: &DashMap<String, Topic>, message: PhoenixMessage) {
    let Some(topic) = topics.get(&message.topic) else {
        trace!(topic = %message.topic, event = %message.event, "Message for unknown topic");
        return;
    };

    match message.event.as_str() {
        "phx_reply" => {
            if message.reference.as_deref() != Some(topic.join_ref.as_str()) {
                return;
            }
            let ok = message.payload.get("status").and_then(Value::as_str) == Some("ok");
            let state = if ok {
                ChannelState::Joined
            } else {
                ChannelState::Errored
            };
            debug!(topic = %message.topic, state = ?state, "Join acknowledged");
            topic.state.send_replace(state);
        }
        "postgres_changes" => match row_from_payload(&message.payload) {
            Some(row) => {
                let _ = topic.rows.send(row);
            }
            None => debug!(topic = %message.topic, "Ignoring change without type"),
        },
        "phx_error" => {
            warn!(topic = %message.topic, "Upstream channel errored");
            topic.state.send_replace(ChannelState::Errored);
        }
        "phx_close" => {
            topic.state.send_replace(ChannelState::Closed);
        }
        _ => trace!(topic = %message.topic, event = %message.event, "Unhandled upstream event"),
    }
}

fn row_from_payload(payload: &Value) -> Option<RowChange> {
    let data = payload.get("data")?;
    let event_type = data.get("type")?.as_str()?;
    let new = data.get("record").filter(|v| !v.is_null()).cloned();
    let old = data.get("old_record").filter(|v| !v.is_null()).cloned();
    Some(RowChange::new(event_type, new, old))
}

#[async_trait]
impl ChangeFeed for PhoenixFeed {
    async fn open(&self, table: &str) -> Result<FeedChannel, ProviderError> {
        if !self.is_connected() {
            return Err(ProviderError::Connection("upstream socket is closed".into()));
        }

        let topic = self.config.topic(table);
        let join_ref = self.next_ref();
        let (rows_tx, rows) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ChannelState::Joining);

        self.topics.insert(
            topic.clone(),
            Topic {
                join_ref: join_ref.clone(),
                rows: rows_tx,
                state: state_tx,
            },
        );

        let message = PhoenixMessage {
            topic: topic.clone(),
            event: "phx_join".into(),
            payload: self.join_payload(table),
            reference: Some(join_ref),
        };
        if let Err(e) = self.send(message) {
            self.topics.remove(&topic);
            return Err(e);
        }
        debug!(topic = %topic, "Joining upstream topic");

        Ok(FeedChannel {
            table: table.to_string(),
            rows,
            state,
        })
    }

    async fn close(&self, table: &str) -> Result<(), ProviderError> {
        let topic = self.config.topic(table);
        let Some((_, entry)) = self.topics.remove(&topic) else {
            return Ok(());
        };
        entry.state.send_replace(ChannelState::Closed);

        if !self.is_connected() {
            return Ok(());
        }
        self.send(PhoenixMessage {
            topic,
            event: "phx_leave".into(),
            payload: json!({}),
            reference: Some(self.next_ref()),
        })
    }

    async fn broadcast(&self, table: &str, event: &str, payload: Value) -> Result<(), ProviderError> {
        let topic = self.config.topic(table);
        if !self.topics.contains_key(&topic) {
            return Err(ProviderError::Channel {
                table: table.to_string(),
                message: "channel not joined".into(),
            });
        }
        self.send(PhoenixMessage {
            topic,
            event: "broadcast".into(),
            payload: json!({ "type": "broadcast", "event": event, "payload": payload }),
            reference: Some(self.next_ref()),
        })
    }

    fn name(&self) -> &'static str {
        "phoenix"
    }
}
