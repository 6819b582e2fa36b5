//! Provider coordination and failover.
//!
//! The coordinator owns the providers in priority order and routes every
//! call to the active one. When a call fails and another provider is
//! healthy, it migrates all tracked connections and subscriptions to that
//! provider and retries the call once.
//!
//! Switching is serialized: at most one migration runs at a time, and
//! connection and subscription calls wait while one is in progress, so the
//! migrated snapshot cannot miss a concurrent change.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ripple_core::{BroadcastRouter, ChangeEvent, ProviderKind};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::traits::{ProviderError, RealtimeProvider};

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Provider {0} is not configured")]
    NotConfigured(ProviderKind),

    #[error("Provider {0} is unhealthy")]
    ProviderUnhealthy(ProviderKind),

    #[error("Provider {kind} failed: {source}")]
    Provider {
        kind: ProviderKind,
        #[source]
        source: ProviderError,
    },

    #[error("Migration to {kind} failed: {source}")]
    Migration {
        kind: ProviderKind,
        #[source]
        source: ProviderError,
    },
}

/// A connection the coordinator knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedConnection {
    pub connection_id: String,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Health of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub kind: ProviderKind,
    pub healthy: bool,
    pub active: bool,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub active: ProviderKind,
    pub providers: Vec<ProviderHealth>,
    pub connections: usize,
    pub subscribed_users: usize,
    pub failovers: u64,
}

/// Routes provider calls to the active provider.
pub struct Coordinator {
    providers: Vec<Arc<dyn RealtimeProvider>>,
    active: AtomicUsize,
    migration: RwLock<()>,
    ready: OnceCell<()>,
    router: BroadcastRouter,
    connections: DashMap<String, TrackedConnection>,
    subscriptions: DashMap<String, BTreeSet<String>>,
    failovers: AtomicU64,
}

impl Coordinator {
    /// Create a coordinator with a primary and an optional fallback.
    #[must_use]
    pub fn new(
        primary: Arc<dyn RealtimeProvider>,
        fallback: Option<Arc<dyn RealtimeProvider>>,
        router: BroadcastRouter,
    ) -> Self {
        let mut providers = vec![primary];
        if let Some(fallback) = fallback {
            if fallback.kind() == providers[0].kind() {
                warn!(provider = %fallback.kind(), "Fallback is the same kind as primary, ignoring");
            } else {
                providers.push(fallback);
            }
        }

        Self {
            providers,
            active: AtomicUsize::new(0),
            migration: RwLock::new(()),
            ready: OnceCell::new(),
            router,
            connections: DashMap::new(),
            subscriptions: DashMap::new(),
            failovers: AtomicU64::new(0),
        }
    }

    /// The broadcast router events are delivered through.
    #[must_use]
    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    /// Kind of the active provider.
    #[must_use]
    pub fn active_kind(&self) -> ProviderKind {
        self.active_provider().kind()
    }

    /// Number of automatic switches so far.
    #[must_use]
    pub fn failover_count(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    fn active_provider(&self) -> Arc<dyn RealtimeProvider> {
        let index = self.active.load(Ordering::SeqCst);
        self.providers[index].clone()
    }

    fn index_of(&self, kind: ProviderKind) -> Option<usize> {
        self.providers.iter().position(|p| p.kind() == kind)
    }

    fn healthy_alternative(&self, current: ProviderKind) -> Option<ProviderKind> {
        self.providers
            .iter()
            .find(|p| p.kind() != current && p.is_healthy())
            .map(|p| p.kind())
    }

    /// Pick the starting provider.
    ///
    /// Runs once; later calls return immediately. If the primary is
    /// unhealthy and another provider is healthy, that one becomes active.
    pub async fn initialize(&self) {
        self.ready
            .get_or_init(|| async {
                let primary = self.providers[0].clone();
                if primary.is_healthy() {
                    info!(provider = %primary.kind(), "Primary provider is healthy");
                    return;
                }

                let Some(alternative) = self.healthy_alternative(primary.kind()) else {
                    warn!(provider = %primary.kind(), "No healthy provider at startup, staying on primary");
                    return;
                };
                match self.switch_provider(alternative).await {
                    Ok(()) => {
                        self.failovers.fetch_add(1, Ordering::Relaxed);
                        info!(provider = %alternative, "Started on fallback provider");
                    }
                    Err(e) => warn!(error = %e, "Startup switch failed"),
                }
            })
            .await;
    }

    /// Run `op` on the active provider, failing over once on error.
    ///
    /// `track` updates the coordinator's own bookkeeping. It runs only once
    /// a provider has accepted the call, inside the same critical section
    /// as that call.
    async fn run<T, B, F, Fut>(&self, op: &'static str, track: B, f: F) -> Result<T, CoordinatorError>
    where
        B: FnOnce(),
        F: Fn(Arc<dyn RealtimeProvider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let (kind, error) = {
            let _gate = self.migration.read().await;
            let provider = self.active_provider();
            let kind = provider.kind();
            match f(provider).await {
                Ok(value) => {
                    track();
                    return Ok(value);
                }
                Err(e) => (kind, e),
            }
        };

        warn!(provider = %kind, operation = op, error = %error, "Provider operation failed");

        let Some(alternative) = self.healthy_alternative(kind) else {
            return Err(CoordinatorError::Provider {
                kind,
                source: error,
            });
        };

        self.switch_provider(alternative).await?;
        self.failovers.fetch_add(1, Ordering::Relaxed);
        info!(from = %kind, to = %alternative, operation = op, "Failed over, retrying");

        let _gate = self.migration.read().await;
        let provider = self.active_provider();
        let kind = provider.kind();
        let value = f(provider)
            .await
            .map_err(|source| CoordinatorError::Provider { kind, source })?;
        track();
        Ok(value)
    }

    /// Track a connection and tell the active provider.
    ///
    /// # Errors
    ///
    /// Returns an error if no provider accepts the connection.
    pub async fn connect(&self, user_id: &str, connection_id: &str) -> Result<(), CoordinatorError> {
        self.initialize().await;
        self.run(
            "connect",
            || {
                self.connections.insert(
                    connection_id.to_string(),
                    TrackedConnection {
                        connection_id: connection_id.to_string(),
                        user_id: user_id.to_string(),
                        connected_at: Utc::now(),
                    },
                );
            },
            |provider| async move { provider.connect(user_id, connection_id).await },
        )
        .await
    }

    /// Forget a connection and tell the active provider.
    ///
    /// # Errors
    ///
    /// Returns an error if no provider accepts the call.
    pub async fn disconnect(&self, connection_id: &str) -> Result<(), CoordinatorError> {
        let result = self
            .run(
                "disconnect",
                || {
                    self.connections.remove(connection_id);
                },
                |provider| async move { provider.disconnect(connection_id).await },
            )
            .await;

        // The socket is gone whether or not a provider heard about it.
        if result.is_err() {
            let _gate = self.migration.read().await;
            self.connections.remove(connection_id);
        }
        result
    }

    /// Add tables to a user's subscriptions.
    ///
    /// # Errors
    ///
    /// Returns an error if no provider accepts the subscription.
    pub async fn subscribe(&self, user_id: &str, tables: &[String]) -> Result<(), CoordinatorError> {
        self.run(
            "subscribe",
            || {
                self.subscriptions
                    .entry(user_id.to_string())
                    .or_default()
                    .extend(tables.iter().cloned());
            },
            |provider| async move { provider.subscribe(user_id, tables).await },
        )
        .await
    }

    /// Remove tables from a user's subscriptions.
    ///
    /// # Errors
    ///
    /// Returns an error if no provider accepts the call.
    pub async fn unsubscribe(&self, user_id: &str, tables: &[String]) -> Result<(), CoordinatorError> {
        self.run(
            "unsubscribe",
            || {
                if let Some(mut entry) = self.subscriptions.get_mut(user_id) {
                    for table in tables {
                        entry.remove(table);
                    }
                }
                self.subscriptions.remove_if(user_id, |_, tables| tables.is_empty());
            },
            |provider| async move { provider.unsubscribe(user_id, tables).await },
        )
        .await
    }

    /// Deliver an event through the active provider.
    ///
    /// The event is stamped with the provider that carries it. Events
    /// carried upstream are also handed to the local router, so every
    /// event reaches local sockets exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error if no provider accepts the event.
    pub async fn broadcast(&self, event: ChangeEvent) -> Result<(), CoordinatorError> {
        let event = &event;
        let delivered = self
            .run(
                "broadcast",
                || {},
                |provider| {
                    let stamped = event.clone().with_provider(provider.kind());
                    async move { provider.broadcast(&stamped).await.map(|()| stamped) }
                },
            )
            .await?;

        if delivered.provider == Some(ProviderKind::External) {
            let count = self.router.dispatch(&delivered).await;
            trace!(event = %delivered.event_name(), recipients = count, "Bridged upstream event locally");
        }
        Ok(())
    }

    /// Fire-and-forget [`broadcast`](Self::broadcast).
    pub fn publish(self: &Arc<Self>, event: ChangeEvent) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let name = event.event_name();
            if let Err(e) = coordinator.broadcast(event).await {
                warn!(event = %name, error = %e, "Failed to publish event");
            }
        });
    }

    /// Emit a named event to every socket of a user.
    pub async fn broadcast_to_user(&self, user_id: &str, event_name: &str, data: Value) -> usize {
        self.router.broadcast_to_user(user_id, event_name, data).await
    }

    /// Move all tracked state to `target` and make it active.
    ///
    /// Switching to the active provider is a no-op. On error the active
    /// provider is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if `target` is not configured, unhealthy or rejects
    /// the migrated state.
    pub async fn switch_provider(&self, target: ProviderKind) -> Result<(), CoordinatorError> {
        let _gate = self.migration.write().await;

        let index = self
            .index_of(target)
            .ok_or(CoordinatorError::NotConfigured(target))?;
        let current = self.active_kind();
        if current == target {
            return Ok(());
        }

        let provider = self.providers[index].clone();
        if !provider.is_healthy() {
            warn!(provider = %target, "Refusing to switch to unhealthy provider");
            return Err(CoordinatorError::ProviderUnhealthy(target));
        }

        info!(from = %current, to = %target, "Switching provider");

        let connections: Vec<TrackedConnection> =
            self.connections.iter().map(|c| c.value().clone()).collect();
        for connection in &connections {
            provider
                .connect(&connection.user_id, &connection.connection_id)
                .await
                .map_err(|source| CoordinatorError::Migration { kind: target, source })?;
        }

        let subscriptions: Vec<(String, Vec<String>)> = self
            .subscriptions
            .iter()
            .map(|e| (e.key().clone(), e.value().iter().cloned().collect()))
            .collect();
        for (user_id, tables) in &subscriptions {
            provider
                .subscribe(user_id, tables)
                .await
                .map_err(|source| CoordinatorError::Migration { kind: target, source })?;
        }

        self.active.store(index, Ordering::SeqCst);
        info!(
            provider = %target,
            connections = connections.len(),
            users = subscriptions.len(),
            "Provider switched"
        );
        Ok(())
    }

    /// Switch away from the active provider if it is unhealthy.
    ///
    /// Returns `true` if a switch happened.
    pub async fn check_health(&self) -> bool {
        let active = self.active_provider();
        if active.is_healthy() {
            return false;
        }

        let Some(alternative) = self.healthy_alternative(active.kind()) else {
            warn!(provider = %active.kind(), "Active provider unhealthy and no healthy fallback");
            return false;
        };

        match self.switch_provider(alternative).await {
            Ok(()) => {
                self.failovers.fetch_add(1, Ordering::Relaxed);
                info!(from = %active.kind(), to = %alternative, "Health check failover");
                true
            }
            Err(e) => {
                warn!(error = %e, "Health check failover failed");
                false
            }
        }
    }

    /// Periodically run [`check_health`](Self::check_health).
    pub fn spawn_health_checks(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.check_health().await;
            }
        })
    }

    /// Deliver upstream change events to local sockets.
    ///
    /// Events on this path came from upstream and are never sent back.
    pub fn spawn_change_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ChangeEvent>,
    ) -> JoinHandle<()> {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                let event = event.with_provider(ProviderKind::External);
                let count = coordinator.router.dispatch(&event).await;
                trace!(event = %event.event_name(), recipients = count, "Delivered upstream change");
            }
            debug!("Change pump finished");
        })
    }

    /// Connections tracked across providers.
    #[must_use]
    pub fn get_active_connections(&self) -> Vec<TrackedConnection> {
        let mut connections: Vec<TrackedConnection> =
            self.connections.iter().map(|c| c.value().clone()).collect();
        connections.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        connections
    }

    /// Tables each user is subscribed to.
    #[must_use]
    pub fn get_subscriptions(&self) -> BTreeMap<String, Vec<String>> {
        self.subscriptions
            .iter()
            .map(|e| (e.key().clone(), e.value().iter().cloned().collect()))
            .collect()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> CoordinatorStatus {
        let active = self.active_kind();
        CoordinatorStatus {
            active,
            providers: self
                .providers
                .iter()
                .map(|p| ProviderHealth {
                    kind: p.kind(),
                    healthy: p.is_healthy(),
                    active: p.kind() == active,
                })
                .collect(),
            connections: self.connections.len(),
            subscribed_users: self.subscriptions.len(),
            failovers: self.failover_count(),
        }
    }
}
