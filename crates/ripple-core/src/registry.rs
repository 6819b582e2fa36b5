//! Connection and subscription registry.
//!
//! The registry maps sockets to users and sockets to subscribed tables in a
//! [`SessionStore`], refreshing a TTL on every write. Realtime delivery is
//! best-effort: when the store fails, every operation logs and degrades to a
//! no-op with an empty or `false` result instead of returning an error.

use crate::event::ProviderKind;
use crate::store::{SessionStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sessions expire after a day without activity.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "realtime:";

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Prefix for every key written to the store.
    pub key_prefix: String,
    /// Time to live refreshed on every write.
    pub session_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }
}

/// Session metadata of a connected socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub socket_id: String,
    pub user_id: String,
    pub provider: ProviderKind,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

fn parse_time(value: Option<&String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn degrade<T: Default>(operation: &'static str, result: Result<T, StoreError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(operation, error = %e, "Session store unavailable, skipping");
            T::default()
        }
    }
}

/// The connection and subscription registry.
pub struct Registry {
    store: Arc<dyn SessionStore>,
    config: RegistryConfig,
}

impl Registry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self::with_config(store, RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn SessionStore>, config: RegistryConfig) -> Self {
        info!(store = store.name(), ?config, "Creating registry");
        Self { store, config }
    }

    fn user_sockets_key(&self, user_id: &str) -> String {
        format!("{}user:{}:sockets", self.config.key_prefix, user_id)
    }

    fn session_key(&self, socket_id: &str) -> String {
        format!("{}socket:{}", self.config.key_prefix, socket_id)
    }

    fn socket_tables_key(&self, socket_id: &str) -> String {
        format!("{}socket:{}:tables", self.config.key_prefix, socket_id)
    }

    fn table_room_key(&self, table: &str) -> String {
        format!("{}room:table:{}", self.config.key_prefix, table)
    }

    fn user_table_room_key(&self, user_id: &str, table: &str) -> String {
        format!("{}room:user:{}:table:{}", self.config.key_prefix, user_id, table)
    }

    fn tables_key(&self) -> String {
        format!("{}tables", self.config.key_prefix)
    }

    async fn touch(&self, key: &str) -> Result<(), StoreError> {
        self.store.expire(key, self.config.session_ttl).await
    }

    /// Record a new authenticated socket for `user_id`.
    ///
    /// A socket belongs to at most one user; re-registering it under another
    /// user moves it.
    pub async fn register_connection(
        &self,
        user_id: &str,
        socket_id: &str,
        provider: ProviderKind,
    ) -> bool {
        degrade(
            "register_connection",
            self.try_register_connection(user_id, socket_id, provider)
                .await,
        )
    }

    async fn try_register_connection(
        &self,
        user_id: &str,
        socket_id: &str,
        provider: ProviderKind,
    ) -> Result<bool, StoreError> {
        let session_key = self.session_key(socket_id);
        let socket = [socket_id.to_string()];

        let existing = self.store.hash_get_all(&session_key).await?;
        if let Some(previous) = existing.get("user_id").filter(|u| *u != user_id) {
            debug!(socket = %socket_id, previous = %previous, user = %user_id, "Moving socket to another user");
            self.store
                .set_remove(&self.user_sockets_key(previous), &socket)
                .await?;

            // Subscriptions belong to the previous owner.
            let tables_key = self.socket_tables_key(socket_id);
            for table in self.store.set_members(&tables_key).await? {
                self.store
                    .set_remove(&self.table_room_key(&table), &socket)
                    .await?;
                self.store
                    .set_remove(&self.user_table_room_key(previous, &table), &socket)
                    .await?;
            }
            self.store.delete(&tables_key).await?;
        }

        let now = Utc::now().to_rfc3339();
        let connected_at = existing
            .get("connected_at")
            .filter(|_| existing.get("user_id").map(String::as_str) == Some(user_id))
            .cloned()
            .unwrap_or_else(|| now.clone());

        self.store
            .hash_set(
                &session_key,
                &[
                    ("user_id", user_id.to_string()),
                    ("provider", provider.to_string()),
                    ("connected_at", connected_at),
                    ("last_activity", now),
                ],
            )
            .await?;
        self.touch(&session_key).await?;

        let user_key = self.user_sockets_key(user_id);
        self.store.set_add(&user_key, &socket).await?;
        self.touch(&user_key).await?;

        debug!(socket = %socket_id, user = %user_id, "Registered connection");
        Ok(true)
    }

    /// Remove every trace of a socket: its user membership, session
    /// metadata, subscription set and room memberships.
    pub async fn remove_connection(&self, socket_id: &str) -> bool {
        degrade(
            "remove_connection",
            self.try_remove_connection(socket_id).await,
        )
    }

    async fn try_remove_connection(&self, socket_id: &str) -> Result<bool, StoreError> {
        let session_key = self.session_key(socket_id);
        let tables_key = self.socket_tables_key(socket_id);
        let socket = [socket_id.to_string()];

        let session = self.store.hash_get_all(&session_key).await?;
        let user_id = session.get("user_id");
        let tables = self.store.set_members(&tables_key).await?;

        for table in &tables {
            self.store
                .set_remove(&self.table_room_key(table), &socket)
                .await?;
            if let Some(user_id) = user_id {
                self.store
                    .set_remove(&self.user_table_room_key(user_id, table), &socket)
                    .await?;
            }
        }

        if let Some(user_id) = user_id {
            self.store
                .set_remove(&self.user_sockets_key(user_id), &socket)
                .await?;
        }

        self.store.delete(&tables_key).await?;
        self.store.delete(&session_key).await?;

        debug!(socket = %socket_id, tables = tables.len(), "Removed connection");
        Ok(user_id.is_some())
    }

    /// Refresh `last_activity` and the TTLs of a socket's keys.
    pub async fn record_activity(&self, socket_id: &str) -> bool {
        degrade(
            "record_activity",
            self.try_record_activity(socket_id).await,
        )
    }

    async fn try_record_activity(&self, socket_id: &str) -> Result<bool, StoreError> {
        let session_key = self.session_key(socket_id);
        let session = self.store.hash_get_all(&session_key).await?;
        let Some(user_id) = session.get("user_id") else {
            return Ok(false);
        };

        self.store
            .hash_set(&session_key, &[("last_activity", Utc::now().to_rfc3339())])
            .await?;
        self.touch(&session_key).await?;
        self.touch(&self.socket_tables_key(socket_id)).await?;
        self.touch(&self.user_sockets_key(user_id)).await?;
        Ok(true)
    }

    /// Socket ids registered for a user.
    pub async fn list_user_sockets(&self, user_id: &str) -> Vec<String> {
        degrade(
            "list_user_sockets",
            self.store.set_members(&self.user_sockets_key(user_id)).await,
        )
    }

    /// Number of users with at least one registered socket.
    pub async fn count_active_users(&self) -> usize {
        let pattern = format!("{}user:*:sockets", self.config.key_prefix);
        degrade("count_active_users", self.store.keys(&pattern).await).len()
    }

    /// Session metadata of a socket.
    pub async fn get_connection(&self, socket_id: &str) -> Option<ConnectionRecord> {
        let session = degrade(
            "get_connection",
            self.store.hash_get_all(&self.session_key(socket_id)).await,
        );

        let record = ConnectionRecord {
            socket_id: socket_id.to_string(),
            user_id: session.get("user_id")?.clone(),
            provider: session.get("provider")?.parse().ok()?,
            connected_at: parse_time(session.get("connected_at"))?,
            last_activity: parse_time(session.get("last_activity"))?,
        };
        Some(record)
    }

    /// Add tables to a socket's subscription set and to the matching rooms.
    ///
    /// Returns the socket's full subscription set afterwards.
    pub async fn subscribe(&self, socket_id: &str, user_id: &str, tables: &[String]) -> Vec<String> {
        degrade(
            "subscribe",
            self.try_subscribe(socket_id, user_id, tables).await,
        )
    }

    async fn try_subscribe(
        &self,
        socket_id: &str,
        user_id: &str,
        tables: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let tables_key = self.socket_tables_key(socket_id);
        let socket = [socket_id.to_string()];

        self.store.set_add(&self.tables_key(), tables).await?;
        self.store.set_add(&tables_key, tables).await?;
        self.touch(&tables_key).await?;

        for table in tables {
            let room = self.table_room_key(table);
            self.store.set_add(&room, &socket).await?;
            self.touch(&room).await?;

            let user_room = self.user_table_room_key(user_id, table);
            self.store.set_add(&user_room, &socket).await?;
            self.touch(&user_room).await?;
        }

        self.subscriptions_of(socket_id).await
    }

    /// Remove tables from a socket's subscription set and rooms.
    ///
    /// Returns the tables the socket is still subscribed to.
    pub async fn unsubscribe(
        &self,
        socket_id: &str,
        user_id: &str,
        tables: &[String],
    ) -> Vec<String> {
        degrade(
            "unsubscribe",
            self.try_unsubscribe(socket_id, user_id, tables).await,
        )
    }

    async fn try_unsubscribe(
        &self,
        socket_id: &str,
        user_id: &str,
        tables: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let socket = [socket_id.to_string()];

        self.store
            .set_remove(&self.socket_tables_key(socket_id), tables)
            .await?;

        for table in tables {
            self.store
                .set_remove(&self.table_room_key(table), &socket)
                .await?;
            self.store
                .set_remove(&self.user_table_room_key(user_id, table), &socket)
                .await?;
        }

        self.subscriptions_of(socket_id).await
    }

    async fn subscriptions_of(&self, socket_id: &str) -> Result<Vec<String>, StoreError> {
        let tables: BTreeSet<String> = self
            .store
            .set_members(&self.socket_tables_key(socket_id))
            .await?
            .into_iter()
            .collect();
        Ok(tables.into_iter().collect())
    }

    /// Tables a socket is subscribed to, sorted.
    pub async fn get_subscriptions(&self, socket_id: &str) -> Vec<String> {
        degrade("get_subscriptions", self.subscriptions_of(socket_id).await)
    }

    /// Sockets subscribed to a table.
    pub async fn table_subscribers(&self, table: &str) -> Vec<String> {
        degrade(
            "table_subscribers",
            self.store.set_members(&self.table_room_key(table)).await,
        )
    }

    /// Every table any socket has subscribed to.
    pub async fn known_tables(&self) -> Vec<String> {
        degrade("known_tables", self.store.set_members(&self.tables_key()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn tables(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn registry() -> (Registry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Registry::new(store.clone()), store)
    }

    /// A store whose backend is always down.
    struct DownStore;

    #[async_trait]
    impl SessionStore for DownStore {
        async fn set_add(&self, _: &str, _: &[String]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set_remove(&self, _: &str, _: &[String]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set_members(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn hash_set(&self, _: &str, _: &[(&str, String)]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn hash_get_all(&self, _: &str) -> Result<HashMap<String, String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn keys(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let (registry, _) = registry();

        assert!(registry.register_connection("u1", "s1", ProviderKind::Local).await);
        assert!(registry.register_connection("u1", "s2", ProviderKind::Local).await);
        assert!(registry.register_connection("u2", "s3", ProviderKind::Local).await);

        assert_eq!(registry.list_user_sockets("u1").await, tables(&["s1", "s2"]));
        assert_eq!(registry.count_active_users().await, 2);

        let record = registry.get_connection("s1").await.unwrap();
        assert_eq!(record.user_id, "u1");
        assert_eq!(record.provider, ProviderKind::Local);
    }

    #[tokio::test]
    async fn test_socket_moves_between_users() {
        let (registry, _) = registry();

        registry.register_connection("u1", "s1", ProviderKind::Local).await;
        registry.register_connection("u2", "s1", ProviderKind::Local).await;

        assert!(registry.list_user_sockets("u1").await.is_empty());
        assert_eq!(registry.list_user_sockets("u2").await, tables(&["s1"]));
        assert_eq!(registry.count_active_users().await, 1);
    }

    #[tokio::test]
    async fn test_moved_socket_drops_previous_subscriptions() {
        let (registry, store) = registry();
        registry.register_connection("u1", "s1", ProviderKind::Local).await;
        registry.subscribe("s1", "u1", &tables(&["goals"])).await;

        registry.register_connection("u2", "s1", ProviderKind::Local).await;

        assert!(registry.get_subscriptions("s1").await.is_empty());
        assert!(registry.table_subscribers("goals").await.is_empty());
        assert!(store.keys("realtime:room:user:u1:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reregistering_same_user_keeps_subscriptions() {
        let (registry, _) = registry();
        registry.register_connection("u1", "s1", ProviderKind::Local).await;
        registry.subscribe("s1", "u1", &tables(&["goals"])).await;

        registry.register_connection("u1", "s1", ProviderKind::External).await;

        assert_eq!(registry.get_subscriptions("s1").await, tables(&["goals"]));
    }

    #[tokio::test]
    async fn test_subscribe_is_set_union() {
        let (registry, _) = registry();
        registry.register_connection("u1", "s1", ProviderKind::Local).await;

        registry.subscribe("s1", "u1", &tables(&["goals"])).await;
        let all = registry.subscribe("s1", "u1", &tables(&["plans", "goals"])).await;

        assert_eq!(all, tables(&["goals", "plans"]));
        assert_eq!(registry.get_subscriptions("s1").await, tables(&["goals", "plans"]));
        assert_eq!(registry.table_subscribers("goals").await, tables(&["s1"]));
        assert_eq!(registry.known_tables().await, tables(&["goals", "plans"]));
    }

    #[tokio::test]
    async fn test_unsubscribe_returns_remaining() {
        let (registry, _) = registry();
        registry.register_connection("u1", "s1", ProviderKind::Local).await;
        registry
            .subscribe("s1", "u1", &tables(&["goals", "plans", "checkpoints"]))
            .await;

        let remaining = registry.unsubscribe("s1", "u1", &tables(&["plans"])).await;
        assert_eq!(remaining, tables(&["checkpoints", "goals"]));
        assert!(registry.table_subscribers("plans").await.is_empty());
        // The global table set only grows
        assert_eq!(registry.known_tables().await.len(), 3);
    }

    #[tokio::test]
    async fn test_remove_connection_leaves_nothing_behind() {
        let (registry, store) = registry();
        registry.register_connection("u1", "s1", ProviderKind::Local).await;
        registry.subscribe("s1", "u1", &tables(&["goals", "plans"])).await;

        assert!(registry.remove_connection("s1").await);

        assert!(registry.list_user_sockets("u1").await.is_empty());
        assert!(registry.get_subscriptions("s1").await.is_empty());
        assert!(registry.table_subscribers("goals").await.is_empty());
        assert!(registry.get_connection("s1").await.is_none());
        // Only the global table set survives
        assert_eq!(
            store.keys("*").await.unwrap(),
            vec!["realtime:tables".to_string()]
        );
    }

    #[tokio::test]
    async fn test_record_activity() {
        let (registry, _) = registry();
        assert!(!registry.record_activity("missing").await);

        registry.register_connection("u1", "s1", ProviderKind::External).await;
        let before = registry.get_connection("s1").await.unwrap();
        assert!(registry.record_activity("s1").await);
        let after = registry.get_connection("s1").await.unwrap();

        assert_eq!(after.connected_at, before.connected_at);
        assert!(after.last_activity >= before.last_activity);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_expire() {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::with_config(
            store.clone(),
            RegistryConfig {
                session_ttl: Duration::from_secs(60),
                ..Default::default()
            },
        );
        registry.register_connection("u1", "s1", ProviderKind::Local).await;

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(registry.record_activity("s1").await);

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(registry.count_active_users().await, 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(registry.count_active_users().await, 0);
        assert!(registry.get_connection("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_degrades() {
        let registry = Registry::new(Arc::new(DownStore));

        assert!(!registry.register_connection("u1", "s1", ProviderKind::Local).await);
        assert!(!registry.remove_connection("s1").await);
        assert!(!registry.record_activity("s1").await);
        assert!(registry.list_user_sockets("u1").await.is_empty());
        assert_eq!(registry.count_active_users().await, 0);
        assert!(registry.subscribe("s1", "u1", &tables(&["goals"])).await.is_empty());
        assert!(registry.unsubscribe("s1", "u1", &tables(&["goals"])).await.is_empty());
        assert!(registry.get_subscriptions("s1").await.is_empty());
        assert!(registry.get_connection("s1").await.is_none());
    }
}
