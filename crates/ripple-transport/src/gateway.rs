//! Client connection gateway.
//!
//! Drives one socket through `Unauthenticated -> Authenticated -> Active ->
//! Closed`. The server feeds it decoded envelopes in arrival order; every
//! reply goes out through the socket's room sender.

use chrono::Utc;
use dashmap::DashMap;
use ripple_core::rooms::{table_room, user_room, user_table_room};
use ripple_core::{Identity, Registry, Rooms, SocketSender, TokenVerifier};
use ripple_protocol::{
    events, ClientRequest, Connected, Envelope, ErrorEvent, Pong, ProtocolError, ReconnectAck,
    RequestError, SubscribeAck, UnsubscribeAck,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;

/// Default socket namespace.
pub const DEFAULT_NAMESPACE: &str = "/realtime";

/// Default number of `reconnect` requests allowed per user.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default number of tables one connection may subscribe to.
pub const DEFAULT_MAX_TABLES: usize = 50;

/// Longest accepted table name.
pub const MAX_TABLE_NAME_LEN: usize = 64;

/// Client-facing messages.
pub mod messages {
    pub const TOKEN_REQUIRED: &str = "인증 토큰이 필요합니다.";
    pub const INVALID_TOKEN: &str = "유효하지 않은 인증 토큰입니다.";
    pub const NOT_AUTHENTICATED: &str = "인증되지 않은 연결입니다.";
    pub const UNAVAILABLE: &str = "실시간 서비스를 사용할 수 없습니다.";
    pub const RECONNECTED: &str = "재연결되었습니다.";
    pub const RECONNECT_LIMIT: &str = "재연결 시도 횟수를 초과했습니다.";
}

/// Gateway errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The connection could not be authenticated. Fatal to the connection.
    #[error("{0}")]
    Authentication(String),

    /// A subscription request was rejected. Returned to the client.
    #[error("{0}")]
    Subscription(String),

    /// The service cannot take the connection.
    #[error("{0}")]
    Unavailable(String),
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub namespace: String,
    pub max_reconnect_attempts: u32,
    pub max_tables_per_connection: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.into(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            max_tables_per_connection: DEFAULT_MAX_TABLES,
        }
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    Active,
    Closed,
}

/// Per-socket state owned by the socket's task.
#[derive(Debug)]
pub struct Session {
    socket_id: String,
    identity: Option<Identity>,
    state: ConnectionState,
}

impl Session {
    pub fn new(socket_id: impl Into<String>) -> Self {
        Self {
            socket_id: socket_id.into(),
            identity: None,
            state: ConnectionState::Unauthenticated,
        }
    }

    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.user_id.as_str())
    }

    fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Authenticated | ConnectionState::Active
        )
    }
}

/// What the socket task should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Close,
}

/// Pick the token from the `token` query parameter or a bearer header.
#[must_use]
pub fn extract_token(query_token: Option<&str>, authorization: Option<&str>) -> Option<String> {
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }
    authorization
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Check a requested table list.
///
/// # Errors
///
/// Returns [`GatewayError::Subscription`] for an empty list or an invalid
/// table name.
pub fn validate_tables(tables: &[String]) -> Result<(), GatewayError> {
    if tables.is_empty() {
        return Err(GatewayError::Subscription(
            "At least one table is required".into(),
        ));
    }
    for table in tables {
        let valid = !table.is_empty()
            && table.len() <= MAX_TABLE_NAME_LEN
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid {
            return Err(GatewayError::Subscription(format!(
                "Invalid table name: {table:?}"
            )));
        }
    }
    Ok(())
}

fn json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Connection lifecycle and request handling.
pub struct Gateway {
    registry: Arc<Registry>,
    rooms: Arc<Rooms>,
    coordinator: Arc<Coordinator>,
    verifier: Arc<dyn TokenVerifier>,
    reconnects: DashMap<String, u32>,
    config: GatewayConfig,
}

impl Gateway {
    #[must_use]
    pub fn new(
        coordinator: Arc<Coordinator>,
        verifier: Arc<dyn TokenVerifier>,
        config: GatewayConfig,
    ) -> Self {
        let router = coordinator.router();
        Self {
            registry: router.registry().clone(),
            rooms: router.rooms().clone(),
            coordinator,
            verifier,
            reconnects: DashMap::new(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn rooms(&self) -> &Arc<Rooms> {
        &self.rooms
    }

    /// Reconnect attempts recorded for a user.
    #[must_use]
    pub fn reconnect_attempts(&self, user_id: &str) -> u32 {
        self.reconnects.get(user_id).map(|a| *a).unwrap_or(0)
    }

    fn reject(session: &mut Session, sender: &SocketSender, message: &str) {
        let _ = sender.send(Envelope::new(
            events::ERROR,
            json(&ErrorEvent {
                message: message.to_string(),
            }),
        ));
        session.state = ConnectionState::Closed;
    }

    fn emit(&self, socket_id: &str, envelope: Envelope) {
        if let Err(e) = self.rooms.emit(socket_id, envelope) {
            debug!(connection = %socket_id, error = %e, "Dropping reply");
        }
    }

    fn respond(&self, session: &Session, request: &Envelope, data: Value) {
        self.emit(&session.socket_id, Envelope::reply_to(request, data));
    }

    fn respond_error(&self, session: &Session, request: &Envelope, error: &str) {
        let data = json(&RequestError {
            error: error.to_string(),
        });
        self.respond(session, request, data);
    }

    /// Authenticate and set up a new connection.
    ///
    /// On failure an `error` event is queued on `sender` and the session is
    /// closed; the caller should drop the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is missing or invalid, or if no provider
    /// accepts the connection.
    pub async fn connect(
        &self,
        session: &mut Session,
        token: Option<&str>,
        sender: SocketSender,
    ) -> Result<(), GatewayError> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            warn!(connection = %session.socket_id, "Connection without token");
            Self::reject(session, &sender, messages::TOKEN_REQUIRED);
            return Err(GatewayError::Authentication(messages::TOKEN_REQUIRED.into()));
        };

        let Some(identity) = self.verifier.verify(token).await else {
            warn!(connection = %session.socket_id, "Connection with invalid token");
            Self::reject(session, &sender, messages::INVALID_TOKEN);
            return Err(GatewayError::Authentication(messages::INVALID_TOKEN.into()));
        };

        let socket_id = session.socket_id.clone();
        let user_id = identity.user_id.clone();
        session.identity = Some(identity);
        session.state = ConnectionState::Authenticated;

        if !self.rooms.attach(&socket_id, sender.clone()) {
            Self::reject(session, &sender, messages::UNAVAILABLE);
            return Err(GatewayError::Unavailable(messages::UNAVAILABLE.into()));
        }
        self.rooms.join(&socket_id, &user_room(&user_id));
        self.coordinator.initialize().await;
        self.registry
            .register_connection(&user_id, &socket_id, self.coordinator.active_kind())
            .await;

        if let Err(e) = self.coordinator.connect(&user_id, &socket_id).await {
            warn!(connection = %socket_id, user = %user_id, error = %e, "No provider accepted connection");
            self.rooms.detach(&socket_id);
            self.registry.remove_connection(&socket_id).await;
            Self::reject(session, &sender, messages::UNAVAILABLE);
            return Err(GatewayError::Unavailable(messages::UNAVAILABLE.into()));
        }

        self.reconnects.remove(&user_id);

        let connected = Connected {
            user_id: user_id.clone(),
            connected_at: Utc::now(),
        };
        self.emit(&socket_id, Envelope::new(events::CONNECTED, json(&connected)));
        info!(connection = %socket_id, user = %user_id, "Client connected");
        Ok(())
    }

    /// Handle one inbound envelope.
    pub async fn handle(&self, session: &mut Session, envelope: Envelope) -> Disposition {
        if !session.is_authenticated() {
            self.respond_error(session, &envelope, messages::NOT_AUTHENTICATED);
            return Disposition::Close;
        }

        let request = match ClientRequest::from_envelope(&envelope) {
            Ok(request) => request,
            Err(ProtocolError::UnknownEvent(event)) => {
                warn!(connection = %session.socket_id, event = %event, "Unknown event");
                self.respond_error(session, &envelope, &format!("Unknown event: {event}"));
                return Disposition::Continue;
            }
            Err(e) => {
                debug!(connection = %session.socket_id, error = %e, "Malformed request");
                self.respond_error(session, &envelope, &e.to_string());
                return Disposition::Continue;
            }
        };

        match request {
            ClientRequest::Subscribe { tables } => {
                match self.subscribe(session, &tables).await {
                    Ok(ack) => self.respond(session, &envelope, json(&ack)),
                    Err(e) => self.respond_error(session, &envelope, &e.to_string()),
                }
                Disposition::Continue
            }
            ClientRequest::Unsubscribe { tables } => {
                match self.unsubscribe(session, &tables).await {
                    Ok(ack) => self.respond(session, &envelope, json(&ack)),
                    Err(e) => self.respond_error(session, &envelope, &e.to_string()),
                }
                Disposition::Continue
            }
            ClientRequest::Ping { timestamp } => {
                self.registry.record_activity(&session.socket_id).await;
                let now = Utc::now();
                let pong = json(&Pong {
                    timestamp: now,
                    latency: timestamp.map_or(0, |sent| now.timestamp_millis() - sent),
                });
                if let Some(id) = envelope.ack {
                    self.emit(
                        &session.socket_id,
                        Envelope::new(events::ACK, pong.clone()).with_ack(id),
                    );
                }
                self.emit(&session.socket_id, Envelope::new(events::PONG, pong));
                Disposition::Continue
            }
            ClientRequest::Reconnect => self.reconnect(session, &envelope).await,
        }
    }

    /// Subscribe the session's socket to `tables`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Subscription`] if the request is invalid or no
    /// provider accepts it.
    pub async fn subscribe(
        &self,
        session: &mut Session,
        tables: &[String],
    ) -> Result<SubscribeAck, GatewayError> {
        let user_id = session
            .user_id()
            .ok_or_else(|| GatewayError::Authentication(messages::NOT_AUTHENTICATED.into()))?
            .to_string();
        validate_tables(tables)?;

        let requested: Vec<String> = tables
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let held = self.socket_tables(&session.socket_id).await;
        let total = held.union(&requested.iter().cloned().collect()).count();
        if total > self.config.max_tables_per_connection {
            return Err(GatewayError::Subscription(format!(
                "Too many tables: at most {} per connection",
                self.config.max_tables_per_connection
            )));
        }

        self.coordinator
            .subscribe(&user_id, &requested)
            .await
            .map_err(|e| GatewayError::Subscription(e.to_string()))?;

        self.registry
            .subscribe(&session.socket_id, &user_id, &requested)
            .await;
        for table in &requested {
            self.rooms.join(&session.socket_id, &table_room(table));
            self.rooms
                .join(&session.socket_id, &user_table_room(&user_id, table));
        }

        session.state = ConnectionState::Active;
        info!(connection = %session.socket_id, user = %user_id, tables = ?requested, "Subscribed");

        Ok(SubscribeAck {
            success: true,
            subscribed_tables: requested,
            timestamp: Utc::now(),
        })
    }

    /// Unsubscribe the session's socket from `tables`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Subscription`] if the request is invalid or no
    /// provider accepts it.
    pub async fn unsubscribe(
        &self,
        session: &mut Session,
        tables: &[String],
    ) -> Result<UnsubscribeAck, GatewayError> {
        let user_id = session
            .user_id()
            .ok_or_else(|| GatewayError::Authentication(messages::NOT_AUTHENTICATED.into()))?
            .to_string();
        validate_tables(tables)?;

        let socket_id = session.socket_id.clone();
        let mut remaining: BTreeSet<String> = self
            .registry
            .unsubscribe(&socket_id, &user_id, tables)
            .await
            .into_iter()
            .collect();
        for table in tables {
            self.rooms.leave(&socket_id, &table_room(table));
            self.rooms.leave(&socket_id, &user_table_room(&user_id, table));
        }
        // Local rooms stay authoritative when the store is down
        remaining.extend(self.room_tables(&socket_id));

        self.release(&user_id, &socket_id, tables)
            .await
            .map_err(|e| GatewayError::Subscription(e.to_string()))?;

        info!(connection = %socket_id, user = %user_id, tables = ?tables, "Unsubscribed");

        Ok(UnsubscribeAck {
            success: true,
            unsubscribed_tables: tables.to_vec(),
            remaining_tables: remaining.into_iter().collect(),
            timestamp: Utc::now(),
        })
    }

    async fn reconnect(&self, session: &mut Session, request: &Envelope) -> Disposition {
        let Some(user_id) = session.user_id().map(str::to_string) else {
            return Disposition::Close;
        };
        let socket_id = session.socket_id.clone();

        let attempt = {
            let mut attempts = self.reconnects.entry(user_id.clone()).or_insert(0);
            *attempts += 1;
            *attempts
        };

        if attempt > self.config.max_reconnect_attempts {
            warn!(connection = %socket_id, user = %user_id, attempt, "Reconnect limit exceeded");
            let error = json(&ErrorEvent {
                message: messages::RECONNECT_LIMIT.into(),
            });
            self.emit(&socket_id, Envelope::new(events::ERROR, error));
            self.respond_error(session, request, messages::RECONNECT_LIMIT);
            session.state = ConnectionState::Closed;
            return Disposition::Close;
        }

        self.registry
            .register_connection(&user_id, &socket_id, self.coordinator.active_kind())
            .await;
        self.rooms.join(&socket_id, &user_room(&user_id));
        for table in self.registry.get_subscriptions(&socket_id).await {
            self.rooms.join(&socket_id, &table_room(&table));
            self.rooms.join(&socket_id, &user_table_room(&user_id, &table));
        }

        debug!(connection = %socket_id, user = %user_id, attempt, "Reconnected");
        let ack = ReconnectAck {
            success: true,
            message: messages::RECONNECTED.into(),
            attempt,
        };
        self.respond(session, request, json(&ack));
        Disposition::Continue
    }

    /// Tear down a connection. Always runs to completion.
    pub async fn disconnect(&self, session: &mut Session) {
        let socket_id = session.socket_id.clone();
        let Some(user_id) = session.user_id().map(str::to_string) else {
            self.rooms.detach(&socket_id);
            session.state = ConnectionState::Closed;
            return;
        };

        let mut tables = self.socket_tables(&socket_id).await;
        self.rooms.detach(&socket_id);
        self.registry.remove_connection(&socket_id).await;

        tables.retain(|t| !t.is_empty());
        let tables: Vec<String> = tables.into_iter().collect();
        if let Err(e) = self.release(&user_id, &socket_id, &tables).await {
            warn!(connection = %socket_id, error = %e, "Failed to release subscriptions");
        }
        if let Err(e) = self.coordinator.disconnect(&socket_id).await {
            warn!(connection = %socket_id, error = %e, "Provider disconnect failed");
        }
        if self.rooms.members(&user_room(&user_id)).is_empty() {
            self.reconnects.remove(&user_id);
        }

        session.state = ConnectionState::Closed;
        info!(connection = %socket_id, user = %user_id, "Client disconnected");
    }

    /// Tell the coordinator about tables no other socket of the user holds.
    async fn release(
        &self,
        user_id: &str,
        socket_id: &str,
        tables: &[String],
    ) -> Result<(), crate::coordinator::CoordinatorError> {
        if tables.is_empty() {
            return Ok(());
        }

        let mut held = BTreeSet::new();
        for table in tables {
            let room = user_table_room(user_id, table);
            if self.rooms.members(&room).iter().any(|s| s != socket_id) {
                held.insert(table.clone());
            }
        }
        for other in self.registry.list_user_sockets(user_id).await {
            if other == socket_id {
                continue;
            }
            for table in self.registry.get_subscriptions(&other).await {
                if tables.contains(&table) {
                    held.insert(table);
                }
            }
        }

        let released: Vec<String> = tables
            .iter()
            .filter(|t| !held.contains(*t))
            .cloned()
            .collect();
        if released.is_empty() {
            return Ok(());
        }
        debug!(user = %user_id, tables = ?released, "Releasing tables");
        self.coordinator.unsubscribe(user_id, &released).await
    }

    /// Tables a socket is subscribed to, from the registry and local rooms.
    async fn socket_tables(&self, socket_id: &str) -> BTreeSet<String> {
        let mut tables: BTreeSet<String> = self
            .registry
            .get_subscriptions(socket_id)
            .await
            .into_iter()
            .collect();
        tables.extend(self.room_tables(socket_id));
        tables
    }

    fn room_tables(&self, socket_id: &str) -> Vec<String> {
        let prefix = table_room("");
        self.rooms
            .rooms_of(socket_id)
            .into_iter()
            .filter_map(|room| room.strip_prefix(prefix.as_str()).map(str::to_string))
            .collect()
    }

    /// Send a protocol error to a connected socket.
    pub fn protocol_error(&self, session: &Session, error: &ProtocolError) {
        let data = json(&ErrorEvent {
            message: error.to_string(),
        });
        self.emit(&session.socket_id, Envelope::new(events::ERROR, data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalProvider;
    use crate::testing::{MockProvider, StaticVerifier};
    use crate::traits::RealtimeProvider;
    use ripple_core::{BroadcastRouter, ChangeEvent, MemoryStore, ProviderKind};
    use serde_json::json;
    use tokio::sync::mpsc;

    type Inbox = mpsc::UnboundedReceiver<Envelope>;

    struct Fixture {
        gateway: Gateway,
        provider: Arc<MockProvider>,
    }

    fn gateway_with(primary: Arc<dyn RealtimeProvider>, config: GatewayConfig) -> Gateway {
        let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));
        let rooms = Arc::new(Rooms::new());
        let router = BroadcastRouter::new(registry, rooms);
        let coordinator = Arc::new(Coordinator::new(primary, None, router));
        let verifier = Arc::new(StaticVerifier::new(&[("tok-u1", "u1"), ("tok-u2", "u2")]));
        Gateway::new(coordinator, verifier, config)
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(MockProvider::new(ProviderKind::Local));
        let gateway = gateway_with(provider.clone(), GatewayConfig::default());
        Fixture { gateway, provider }
    }

    async fn connect(gateway: &Gateway, socket: &str, token: &str) -> (Session, Inbox) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(socket);
        gateway.connect(&mut session, Some(token), tx).await.unwrap();
        let connected = rx.try_recv().unwrap();
        assert_eq!(connected.event, events::CONNECTED);
        (session, rx)
    }

    fn subscribe(tables: &[&str]) -> Envelope {
        Envelope::new(events::SUBSCRIBE, json!({ "tables": tables }))
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let f = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new("s1");

        let result = f.gateway.connect(&mut session, None, tx).await;

        assert!(matches!(result, Err(GatewayError::Authentication(_))));
        assert_eq!(session.state(), ConnectionState::Closed);
        let error = rx.try_recv().unwrap();
        assert_eq!(error.event, events::ERROR);
        assert_eq!(error.data["message"], messages::TOKEN_REQUIRED);
        assert!(f.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let f = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new("s1");

        let result = f.gateway.connect(&mut session, Some("bogus"), tx).await;

        assert_eq!(
            result,
            Err(GatewayError::Authentication(messages::INVALID_TOKEN.into()))
        );
        assert_eq!(rx.try_recv().unwrap().data["message"], messages::INVALID_TOKEN);
        assert!(!f.gateway.rooms().is_attached("s1"));
    }

    #[tokio::test]
    async fn test_connect_registers() {
        let f = fixture();
        let (session, _rx) = connect(&f.gateway, "s1", "tok-u1").await;

        assert_eq!(session.state(), ConnectionState::Authenticated);
        assert_eq!(session.user_id(), Some("u1"));
        assert_eq!(f.gateway.registry().list_user_sockets("u1").await, vec!["s1"]);
        assert_eq!(f.gateway.rooms().members(&user_room("u1")), vec!["s1"]);
        assert_eq!(f.provider.calls(), vec!["connect:u1:s1"]);
    }

    #[tokio::test]
    async fn test_subscribe_activates() {
        let f = fixture();
        let (mut session, mut rx) = connect(&f.gateway, "s1", "tok-u1").await;

        let disposition = f
            .gateway
            .handle(&mut session, subscribe(&["goals", "plans", "goals"]))
            .await;

        assert_eq!(disposition, Disposition::Continue);
        assert_eq!(session.state(), ConnectionState::Active);
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.event, events::SUBSCRIBE);
        assert_eq!(reply.data["success"], true);
        assert_eq!(reply.data["subscribedTables"], json!(["goals", "plans"]));

        assert_eq!(
            f.gateway.registry().get_subscriptions("s1").await,
            vec!["goals", "plans"]
        );
        assert_eq!(f.gateway.rooms().members(&table_room("goals")), vec!["s1"]);
        assert!(f
            .provider
            .calls()
            .contains(&"subscribe:u1:goals,plans".to_string()));
    }

    #[tokio::test]
    async fn test_subscribe_errors_keep_connection() {
        let f = fixture();
        let (mut session, mut rx) = connect(&f.gateway, "s1", "tok-u1").await;

        let disposition = f.gateway.handle(&mut session, subscribe(&[])).await;
        assert_eq!(disposition, Disposition::Continue);
        assert!(rx.try_recv().unwrap().data["error"].is_string());

        f.gateway
            .handle(&mut session, subscribe(&["goals; drop"]))
            .await;
        assert!(rx.try_recv().unwrap().data["error"]
            .as_str()
            .unwrap()
            .contains("Invalid table name"));
        assert_eq!(session.state(), ConnectionState::Authenticated);
    }

    #[tokio::test]
    async fn test_table_limit() {
        let provider = Arc::new(MockProvider::new(ProviderKind::Local));
        let gateway = gateway_with(
            provider,
            GatewayConfig {
                max_tables_per_connection: 2,
                ..Default::default()
            },
        );
        let (mut session, _rx) = connect(&gateway, "s1", "tok-u1").await;

        gateway
            .subscribe(&mut session, &["goals".into(), "plans".into()])
            .await
            .unwrap();
        let result = gateway.subscribe(&mut session, &["habits".into()]).await;
        assert!(matches!(result, Err(GatewayError::Subscription(_))));

        // Re-subscribing to held tables stays within the limit
        assert!(gateway.subscribe(&mut session, &["goals".into()]).await.is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_reports_remaining() {
        let f = fixture();
        let (mut session, mut rx) = connect(&f.gateway, "s1", "tok-u1").await;
        f.gateway
            .handle(&mut session, subscribe(&["goals", "plans"]))
            .await;
        rx.try_recv().unwrap();

        f.gateway
            .handle(
                &mut session,
                Envelope::new(events::UNSUBSCRIBE, json!({"tables": ["goals"]})),
            )
            .await;

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.data["unsubscribedTables"], json!(["goals"]));
        assert_eq!(reply.data["remainingTables"], json!(["plans"]));
        assert!(f.gateway.rooms().members(&table_room("goals")).is_empty());
        assert!(f.provider.calls().contains(&"unsubscribe:u1:goals".to_string()));
    }

    #[tokio::test]
    async fn test_ack_replies() {
        let f = fixture();
        let (mut session, mut rx) = connect(&f.gateway, "s1", "tok-u1").await;

        f.gateway
            .handle(&mut session, subscribe(&["goals"]).with_ack(9))
            .await;

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.event, events::ACK);
        assert_eq!(reply.ack, Some(9));
        assert_eq!(reply.data["success"], true);
    }

    #[tokio::test]
    async fn test_unknown_event() {
        let f = fixture();
        let (mut session, mut rx) = connect(&f.gateway, "s1", "tok-u1").await;

        let disposition = f
            .gateway
            .handle(&mut session, Envelope::new("teleport", json!({})))
            .await;

        assert_eq!(disposition, Disposition::Continue);
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.event, "teleport");
        assert!(reply.data["error"].as_str().unwrap().contains("teleport"));
    }

    #[tokio::test]
    async fn test_unauthenticated_messages_close() {
        let f = fixture();
        let mut session = Session::new("s1");
        let disposition = f.gateway.handle(&mut session, subscribe(&["goals"])).await;
        assert_eq!(disposition, Disposition::Close);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let f = fixture();
        let (mut session, mut rx) = connect(&f.gateway, "s1", "tok-u1").await;
        let sent = Utc::now().timestamp_millis() - 250;

        f.gateway
            .handle(
                &mut session,
                Envelope::new(events::PING, json!({"timestamp": sent})),
            )
            .await;

        let pong = rx.try_recv().unwrap();
        assert_eq!(pong.event, events::PONG);
        assert!(pong.data["latency"].as_i64().unwrap() >= 250);

        f.gateway
            .handle(&mut session, Envelope::new(events::PING, Value::Null))
            .await;
        assert_eq!(rx.try_recv().unwrap().data["latency"], 0);
    }

    #[tokio::test]
    async fn test_reconnect_cap() {
        let f = fixture();
        let (mut session, mut rx) = connect(&f.gateway, "s1", "tok-u1").await;
        let request = Envelope::new(events::RECONNECT, json!({}));

        for attempt in 1..=DEFAULT_MAX_RECONNECT_ATTEMPTS {
            let disposition = f.gateway.handle(&mut session, request.clone()).await;
            assert_eq!(disposition, Disposition::Continue);
            let reply = rx.try_recv().unwrap();
            assert_eq!(reply.data["success"], true);
            assert_eq!(reply.data["attempt"], attempt);
        }

        let disposition = f.gateway.handle(&mut session, request).await;
        assert_eq!(disposition, Disposition::Close);
        let error = rx.try_recv().unwrap();
        assert_eq!(error.event, events::ERROR);
        assert_eq!(error.data["message"], messages::RECONNECT_LIMIT);
        assert_eq!(rx.try_recv().unwrap().data["error"], messages::RECONNECT_LIMIT);
    }

    #[tokio::test]
    async fn test_clean_connect_resets_reconnects() {
        let f = fixture();
        let (mut session, _rx) = connect(&f.gateway, "s1", "tok-u1").await;
        f.gateway
            .handle(&mut session, Envelope::new(events::RECONNECT, json!({})))
            .await;
        assert_eq!(f.gateway.reconnect_attempts("u1"), 1);

        let _second = connect(&f.gateway, "s2", "tok-u1").await;
        assert_eq!(f.gateway.reconnect_attempts("u1"), 0);
    }

    #[tokio::test]
    async fn test_last_disconnect_clears_reconnects() {
        let f = fixture();
        let (mut first, _rx1) = connect(&f.gateway, "s1", "tok-u1").await;
        let (mut second, _rx2) = connect(&f.gateway, "s2", "tok-u1").await;
        f.gateway
            .handle(&mut first, Envelope::new(events::RECONNECT, json!({})))
            .await;

        f.gateway.disconnect(&mut first).await;
        assert_eq!(f.gateway.reconnect_attempts("u1"), 1);

        f.gateway.disconnect(&mut second).await;
        assert_eq!(f.gateway.reconnect_attempts("u1"), 0);
    }

    #[tokio::test]
    async fn test_connect_records_provider_after_startup_failover() {
        let local = Arc::new(MockProvider::new(ProviderKind::Local));
        let external = Arc::new(MockProvider::new(ProviderKind::External));
        local.set_healthy(false);

        let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));
        let router = BroadcastRouter::new(registry, Arc::new(Rooms::new()));
        let coordinator = Arc::new(Coordinator::new(local, Some(external), router));
        let verifier = Arc::new(StaticVerifier::new(&[("tok-u1", "u1")]));
        let gateway = Gateway::new(coordinator, verifier, GatewayConfig::default());

        let _conn = connect(&gateway, "s1", "tok-u1").await;

        let record = gateway.registry().get_connection("s1").await.unwrap();
        assert_eq!(record.provider, ProviderKind::External);
    }

    #[tokio::test]
    async fn test_reconnect_rejoins_rooms() {
        let f = fixture();
        let (mut session, mut rx) = connect(&f.gateway, "s1", "tok-u1").await;
        f.gateway.handle(&mut session, subscribe(&["goals"])).await;
        rx.try_recv().unwrap();

        f.gateway.rooms().leave("s1", &table_room("goals"));
        f.gateway
            .handle(&mut session, Envelope::new(events::RECONNECT, json!({})))
            .await;

        assert_eq!(f.gateway.rooms().members(&table_room("goals")), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_disconnect_releases_unheld_tables() {
        let f = fixture();
        let (mut first, _rx1) = connect(&f.gateway, "s1", "tok-u1").await;
        let (mut second, _rx2) = connect(&f.gateway, "s2", "tok-u1").await;
        f.gateway.subscribe(&mut first, &["goals".into(), "plans".into()]).await.unwrap();
        f.gateway.subscribe(&mut second, &["goals".into()]).await.unwrap();

        f.gateway.disconnect(&mut first).await;
        assert_eq!(first.state(), ConnectionState::Closed);
        let calls = f.provider.calls();
        assert!(calls.contains(&"unsubscribe:u1:plans".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("unsubscribe") && c.contains("goals")));
        assert!(calls.contains(&"disconnect:s1".to_string()));
        assert!(f.gateway.registry().get_connection("s1").await.is_none());
        assert!(!f.gateway.rooms().is_attached("s1"));

        f.gateway.disconnect(&mut second).await;
        assert!(f.provider.calls().contains(&"unsubscribe:u1:goals".to_string()));
        assert_eq!(f.gateway.registry().count_active_users().await, 0);
    }

    #[tokio::test]
    async fn test_goal_insert_reaches_owner_socket() {
        let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));
        let rooms = Arc::new(Rooms::new());
        let router = BroadcastRouter::new(registry, rooms);
        let local = Arc::new(LocalProvider::new(router.clone()));
        let coordinator = Arc::new(Coordinator::new(local, None, router));
        let gateway = Gateway::new(
            coordinator.clone(),
            Arc::new(StaticVerifier::new(&[("tok-u1", "u1")])),
            GatewayConfig::default(),
        );

        let (mut session, mut rx) = connect(&gateway, "s1", "tok-u1").await;
        gateway.handle(&mut session, subscribe(&["goals"])).await;
        rx.try_recv().unwrap();

        coordinator
            .broadcast(ChangeEvent::insert("goals", json!({"id": "g1"})).with_user("u1"))
            .await
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event, "goals:insert");
        assert_eq!(event.data["record"]["id"], "g1");
        assert_eq!(event.data["event"], "INSERT");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(extract_token(Some("abc"), None).as_deref(), Some("abc"));
        assert_eq!(
            extract_token(None, Some("Bearer xyz")).as_deref(),
            Some("xyz")
        );
        assert_eq!(
            extract_token(Some(""), Some("Bearer xyz")).as_deref(),
            Some("xyz")
        );
        assert_eq!(extract_token(None, Some("Basic xyz")), None);
        assert_eq!(extract_token(None, None), None);
    }

    #[test]
    fn test_validate_tables() {
        assert!(validate_tables(&["goals".into(), "public.plans".into(), "a-b_c".into()]).is_ok());
        assert!(validate_tables(&[]).is_err());
        assert!(validate_tables(&["".into()]).is_err());
        assert!(validate_tables(&["x".repeat(MAX_TABLE_NAME_LEN + 1)]).is_err());
        assert!(validate_tables(&["goals/1".into()]).is_err());
    }
}
