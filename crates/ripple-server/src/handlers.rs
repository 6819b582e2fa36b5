//! Connection handlers for the Ripple server.
//!
//! This module wires the realtime stack together, serves the socket
//! namespace and `/health`, and runs each socket's read and write loops.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use ripple_core::rooms::generate_socket_id;
use ripple_core::{
    BroadcastRouter, JwtVerifier, MemoryStore, ProviderKind, Registry, RegistryConfig, Rooms,
    SessionStore,
};
use ripple_protocol::{codec, Envelope};
use ripple_transport::gateway::extract_token;
use ripple_transport::{
    Coordinator, Disposition, ExternalChangeProvider, Gateway, GatewayConfig, LocalProvider,
    PhoenixConfig, PhoenixFeed, RealtimeProvider, Session,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub config: Config,
}

/// The assembled realtime stack.
pub struct Services {
    pub state: Arc<AppState>,
    pub external: Option<Arc<ExternalChangeProvider>>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Services {
    /// Stop background work and close upstream channels.
    pub async fn shutdown(self) {
        self.state.gateway.rooms().close();
        if let Some(external) = &self.external {
            external.shutdown().await;
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn session_store(
    config: &Config,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<Arc<dyn SessionStore>> {
    #[cfg(feature = "redis")]
    if let Some(url) = &config.session.redis_url {
        let store = ripple_core::RedisStore::connect(url)
            .await
            .context("Failed to connect session store")?;
        return Ok(Arc::new(store));
    }

    #[cfg(not(feature = "redis"))]
    if config.session.redis_url.is_some() {
        warn!("session.redis_url is set but the redis feature is disabled, using memory store");
    }

    let memory = Arc::new(MemoryStore::new());
    let purged = memory.clone();
    let interval = config.purge_interval();
    tasks.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = purged.purge_expired();
            if removed > 0 {
                debug!(removed, "Purged expired session keys");
            }
        }
    }));
    Ok(memory)
}

async fn external_provider(
    config: &Config,
) -> Option<(ExternalChangeProvider, mpsc::UnboundedReceiver<ripple_core::ChangeEvent>)> {
    if !config.external.enabled {
        return None;
    }

    let feed_config = PhoenixConfig {
        url: config.external.url.clone(),
        api_key: config.external.api_key.clone(),
        schema: config.external.schema.clone(),
        heartbeat_interval: Duration::from_millis(config.external.heartbeat_interval_ms),
        access_token: config.external.access_token.clone(),
    };
    match PhoenixFeed::connect(feed_config).await {
        Ok(feed) => {
            let (provider, events) = ExternalChangeProvider::new(Arc::new(feed));
            Some((provider.with_owner_field(&config.external.owner_field), events))
        }
        Err(e) => {
            warn!(error = %e, "External change feed unavailable");
            None
        }
    }
}

/// Assemble registry, providers, coordinator and gateway.
///
/// # Errors
///
/// Returns an error if the session store cannot be reached.
pub async fn build(config: &Config) -> Result<Services> {
    let mut tasks = Vec::new();

    let store = session_store(config, &mut tasks).await?;
    let registry = Arc::new(Registry::with_config(
        store,
        RegistryConfig {
            key_prefix: config.session.key_prefix.clone(),
            session_ttl: Duration::from_secs(config.session.ttl_secs),
        },
    ));
    let rooms = Arc::new(Rooms::new());
    let router = BroadcastRouter::new(registry, rooms);

    let local: Arc<dyn RealtimeProvider> = Arc::new(LocalProvider::new(router.clone()));
    let (external, events) = match external_provider(config).await {
        Some((provider, events)) => (Some(Arc::new(provider)), Some(events)),
        None => (None, None),
    };

    let provider_for = |kind: ProviderKind| -> Option<Arc<dyn RealtimeProvider>> {
        match kind {
            ProviderKind::Local => Some(local.clone()),
            ProviderKind::External => external
                .clone()
                .map(|e| e as Arc<dyn RealtimeProvider>),
        }
    };
    let mut chain: Vec<Arc<dyn RealtimeProvider>> = [Some(config.realtime.primary), config.realtime.fallback]
        .into_iter()
        .flatten()
        .filter_map(provider_for)
        .collect();
    if chain.is_empty() {
        warn!("Configured providers unavailable, using local provider");
        chain.push(local.clone());
    }
    let primary = chain.remove(0);
    let fallback = chain.into_iter().next();
    info!(
        primary = %primary.kind(),
        fallback = ?fallback.as_ref().map(|f| f.kind()),
        "Providers configured"
    );

    let coordinator = Arc::new(Coordinator::new(primary, fallback, router));
    coordinator.initialize().await;
    if let Some(events) = events {
        tasks.push(coordinator.spawn_change_pump(events));
    }
    tasks.push(coordinator.spawn_health_checks(config.health_check_interval()));

    let status_source = coordinator.clone();
    let interval = config.health_check_interval();
    tasks.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            metrics::record_status(&status_source.status());
        }
    }));

    let mut verifier = JwtVerifier::new(&config.auth.jwt_secret);
    if let Some(issuer) = &config.auth.issuer {
        verifier = verifier.with_issuer(issuer);
    }
    if let Some(audience) = &config.auth.audience {
        verifier = verifier.with_audience(audience);
    }

    let gateway = Arc::new(Gateway::new(
        coordinator,
        Arc::new(verifier),
        GatewayConfig {
            namespace: config.realtime.namespace.clone(),
            max_reconnect_attempts: config.realtime.max_reconnect_attempts,
            max_tables_per_connection: config.realtime.max_tables_per_connection,
        },
    ));

    Ok(Services {
        state: Arc::new(AppState {
            gateway,
            config: config.clone(),
        }),
        external,
        tasks,
    })
}

/// HTTP routes.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.realtime.namespace, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let services = build(&config).await?;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Ripple server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.realtime.namespace
    );

    let rooms = services.state.gateway.rooms().clone();
    axum::serve(listener, app(services.state.clone()))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutting down");
            rooms.close();
        })
        .await?;

    services.shutdown().await;
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let gateway = &state.gateway;
    let status = gateway.coordinator().status();
    let healthy = |kind: ProviderKind| {
        status
            .providers
            .iter()
            .find(|p| p.kind == kind)
            .map(|p| p.healthy)
    };

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "provider": {
            "active": status.active,
            "local": healthy(ProviderKind::Local),
            "external": healthy(ProviderKind::External),
        },
        "connections": gateway.rooms().connection_count(),
        "activeUsers": gateway.registry().count_active_users().await,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let token = extract_token(
        params.get("token").map(String::as_str),
        headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
    );
    ws.on_upgrade(move |socket| handle_websocket(socket, token, state))
}

fn encode_outbound(envelope: &Envelope, binary: bool) -> Option<Message> {
    let encoded = if binary {
        codec::encode(envelope).map(|data| Message::Binary(data.to_vec()))
    } else {
        codec::encode_text(envelope).map(Message::Text)
    };
    match encoded {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(event = %envelope.event, error = %e, "Failed to encode envelope");
            metrics::record_error("encode");
            None
        }
    }
}

async fn dispatch(state: &AppState, session: &mut Session, envelope: Envelope) -> Disposition {
    let start = Instant::now();
    let event = envelope.event.clone();
    let disposition = state.gateway.handle(session, envelope).await;
    metrics::record_request(&event, start.elapsed().as_secs_f64());
    disposition
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, token: Option<String>, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let socket_id = generate_socket_id();
    debug!(connection = %socket_id, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    // Replies follow the framing the client last used
    let binary = Arc::new(AtomicBool::new(false));
    let writer_binary = binary.clone();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let Some(message) = encode_outbound(&envelope, writer_binary.load(Ordering::Relaxed))
            else {
                continue;
            };
            let len = match &message {
                Message::Text(text) => text.len(),
                Message::Binary(data) => data.len(),
                _ => 0,
            };
            if sink.send(message).await.is_err() {
                break;
            }
            metrics::record_message(len, "outbound");
        }
        let _ = sink.close().await;
    });

    let mut session = Session::new(socket_id.clone());
    if state
        .gateway
        .connect(&mut session, token.as_deref(), tx)
        .await
        .is_err()
    {
        metrics::record_error("auth");
        // The error event is flushed before the writer closes the socket
        let _ = writer.await;
        return;
    }

    let mut read_buffer = BytesMut::with_capacity(4096);

    'read: while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                metrics::record_message(text.len(), "inbound");
                binary.store(false, Ordering::Relaxed);
                match codec::decode_text(&text) {
                    Ok(envelope) => {
                        if dispatch(&state, &mut session, envelope).await == Disposition::Close {
                            break 'read;
                        }
                    }
                    Err(e) => {
                        debug!(connection = %socket_id, error = %e, "Malformed text frame");
                        state.gateway.protocol_error(&session, &e);
                    }
                }
            }
            Ok(Message::Binary(data)) => {
                metrics::record_message(data.len(), "inbound");
                binary.store(true, Ordering::Relaxed);
                read_buffer.extend_from_slice(&data);
                loop {
                    match codec::decode_from(&mut read_buffer) {
                        Ok(Some(envelope)) => {
                            if dispatch(&state, &mut session, envelope).await == Disposition::Close
                            {
                                break 'read;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(connection = %socket_id, error = %e, "Malformed binary frame");
                            state.gateway.protocol_error(&session, &e);
                            read_buffer.clear();
                            break;
                        }
                    }
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(connection = %socket_id, "Received close frame");
                break;
            }
            Err(e) => {
                warn!(connection = %socket_id, error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }
    }

    state.gateway.disconnect(&mut session).await;
    // Detaching dropped the last sender; wait for queued replies to flush
    let _ = writer.await;

    debug!(connection = %socket_id, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use ripple_core::ChangeEvent;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    const SECRET: &str = "test-secret";

    fn test_config() -> Config {
        let mut config = Config::default();
        config.auth.jwt_secret = SECRET.into();
        config
    }

    fn token(user_id: &str) -> String {
        let claims = json!({
            "sub": user_id,
            "exp": (Utc::now() + ChronoDuration::hours(1)).timestamp(),
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    async fn serve() -> (std::net::SocketAddr, Services) {
        let services = build(&test_config()).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(services.state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (addr, services)
    }

    async fn next_envelope<S>(stream: &mut S) -> Envelope
    where
        S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let message = timeout(std::time::Duration::from_secs(2), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = message {
                return codec::decode_text(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_build_uses_local_without_external() {
        let services = build(&test_config()).await.unwrap();
        let coordinator = services.state.gateway.coordinator();
        assert_eq!(coordinator.active_kind(), ProviderKind::Local);
        assert!(services.external.is_none());
        services.shutdown().await;
    }

    #[tokio::test]
    async fn test_socket_end_to_end() {
        let (addr, services) = serve().await;
        let url = format!("ws://{addr}/realtime?token={}", token("u1"));
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

        let connected = next_envelope(&mut ws).await;
        assert_eq!(connected.event, "connected");
        assert_eq!(connected.data["userId"], "u1");

        let subscribe = Envelope::new("subscribe", json!({"tables": ["goals"]})).with_ack(1);
        ws.send(WsMessage::Text(codec::encode_text(&subscribe).unwrap()))
            .await
            .unwrap();
        let ack = next_envelope(&mut ws).await;
        assert_eq!(ack.event, "ack");
        assert_eq!(ack.ack, Some(1));
        assert_eq!(ack.data["subscribedTables"], json!(["goals"]));

        services
            .state
            .gateway
            .coordinator()
            .broadcast(ChangeEvent::insert("goals", json!({"id": "g1"})).with_user("u1"))
            .await
            .unwrap();

        let change = next_envelope(&mut ws).await;
        assert_eq!(change.event, "goals:insert");
        assert_eq!(change.data["record"]["id"], "g1");

        ws.close(None).await.unwrap();
        services.shutdown().await;
    }

    #[tokio::test]
    async fn test_socket_without_token_is_rejected() {
        let (addr, services) = serve().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/realtime").as_str())
            .await
            .unwrap();

        let error = next_envelope(&mut ws).await;
        assert_eq!(error.event, "error");
        assert!(error.data["message"].is_string());
        services.shutdown().await;
    }

    #[tokio::test]
    async fn test_health() {
        let (addr, services) = serve().await;
        let url = format!("ws://{addr}/realtime?token={}", token("u1"));
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        next_envelope(&mut ws).await;

        let response = health_handler(State(services.state.clone()))
            .await
            .into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(health["status"], "ok");
        assert_eq!(health["provider"]["active"], "local");
        assert_eq!(health["provider"]["local"], true);
        assert!(health["provider"]["external"].is_null());
        assert_eq!(health["connections"], 1);
        assert_eq!(health["activeUsers"], 1);
        services.shutdown().await;
    }
}
