//! Session store abstraction.
//!
//! The registry keeps its state in a TTL key-value store that offers set and
//! hash values. [`MemoryStore`] is the in-process implementation; a Redis
//! backed store is available with the `redis` feature.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

/// Session store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The key holds a value of another type.
    #[error("Wrong value type for key: {0}")]
    WrongType(String),

    /// Any other backend failure.
    #[error("Store error: {0}")]
    Backend(String),
}

/// A TTL key-value store with set and hash values.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Add members to the set at `key`.
    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StoreError>;

    /// Remove members from the set at `key`. Empty sets are deleted.
    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StoreError>;

    /// All members of the set at `key`.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Set fields of the hash at `key`.
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError>;

    /// All fields of the hash at `key`.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Delete `key`.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Set the time to live of `key`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Keys matching a glob pattern (`*` wildcard).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Store name for logs.
    fn name(&self) -> &'static str;
}

#[derive(Debug)]
enum StoredValue {
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: StoredValue) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn is_empty(&self) -> bool {
        match &self.value {
            StoredValue::Set(s) => s.is_empty(),
            StoredValue::Hash(h) => h.is_empty(),
        }
    }
}

/// In-process session store.
///
/// Expired keys are dropped lazily when touched and in bulk by
/// [`MemoryStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Check if the store holds no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired key. Returns the number of keys removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            trace!(removed, "Purged expired session keys");
        }
        removed
    }

    fn evict_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }

    fn remove_if_empty(&self, key: &str) {
        self.entries.remove_if(key, |_, entry| entry.is_empty());
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        if members.is_empty() {
            return Ok(());
        }
        self.evict_if_expired(key);

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(StoredValue::Set(HashSet::new())));

        match &mut entry.value {
            StoredValue::Set(set) => {
                set.extend(members.iter().cloned());
                Ok(())
            }
            StoredValue::Hash(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        self.evict_if_expired(key);

        if let Some(mut entry) = self.entries.get_mut(key) {
            match &mut entry.value {
                StoredValue::Set(set) => {
                    for member in members {
                        set.remove(member);
                    }
                }
                StoredValue::Hash(_) => return Err(StoreError::WrongType(key.to_string())),
            }
        }

        self.remove_if_empty(key);
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.evict_if_expired(key);

        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                StoredValue::Set(set) => {
                    let mut members: Vec<String> = set.iter().cloned().collect();
                    members.sort();
                    Ok(members)
                }
                StoredValue::Hash(_) => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        self.evict_if_expired(key);

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(StoredValue::Hash(HashMap::new())));

        match &mut entry.value {
            StoredValue::Hash(hash) => {
                for (field, value) in fields {
                    hash.insert((*field).to_string(), value.clone());
                }
                Ok(())
            }
            StoredValue::Set(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.evict_if_expired(key);

        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                StoredValue::Hash(hash) => Ok(hash.clone()),
                StoredValue::Set(_) => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(HashMap::new()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.evict_if_expired(key);

        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.is_expired(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Match `text` against a pattern where `*` matches any run of characters.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
