//! Namespaced transient key/value store.
//!
//! ## Architecture
//!
//! ```text
//! add/get/remove ──> RwLock<HashMap<"ns:key", entry>>   (write-through cache)
//!                          │ miss / write
//!                          ▼
//!                     KvBackend (SQLite or no-op)
//! ```
//!
//! Entries may carry a TTL. Expired entries are invisible to reads and are
//! removed lazily on access and by a periodic purge task. Backend failures are
//! logged and otherwise ignored: losing durable state only costs context
//! recovery, never a request.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{KvBackend, NoopBackend};
use crate::models::TransientEntry;

/// Default interval of the expiry purge task.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

fn cache_key(namespace: &str, key: &str) -> String {
    format!("{namespace}:{key}")
}

fn expiry(ttl: Option<Duration>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    ttl.map(|ttl| {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    })
}

/// Ephemeral key/value cache over a persistence backend.
pub struct TransientStore {
    entries: RwLock<HashMap<String, TransientEntry>>,
    backend: Arc<dyn KvBackend>,
}

impl std::fmt::Debug for TransientStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransientStore")
            .field("cached", &self.entries.read().len())
            .finish()
    }
}

impl TransientStore {
    /// Creates a store over `backend`.
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            backend,
        }
    }

    /// Creates a memory-only store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(NoopBackend))
    }

    /// Stores `value` under `key` in `namespace`, optionally expiring after
    /// `ttl`.
    pub fn add(&self, namespace: &str, key: &str, value: Value, ttl: Option<Duration>) {
        let entry = TransientEntry {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value,
            expires_at: expiry(ttl, Utc::now()),
        };

        let mut entries = self.entries.write();
        self.persist(&entry);
        entries.insert(cache_key(namespace, key), entry);
    }

    /// Stores a serializable value.
    pub fn add_as<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> serde_json::Result<()> {
        self.add(namespace, key, serde_json::to_value(value)?, ttl);
        Ok(())
    }

    /// Returns the live value under `key`, consulting the backend on a miss.
    pub fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        let now = Utc::now();
        let id = cache_key(namespace, key);

        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&id) {
                if !entry.is_expired(now) {
                    return Some(entry.value.clone());
                }
            }
        }

        let mut entries = self.entries.write();
        self.lookup_locked(&mut entries, namespace, key, now)
            .map(|entry| entry.value.clone())
    }

    /// Returns the live value deserialized as `T`. Undecodable values are
    /// treated as absent.
    pub fn get_as<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
        let value = self.get(namespace, key)?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(namespace, key, error = %e, "Discarding undecodable transient entry");
                None
            }
        }
    }

    /// Removes the entry under `key` and returns its live value.
    ///
    /// Concurrent callers racing on the same key see the value at most once.
    pub fn remove(&self, namespace: &str, key: &str) -> Option<Value> {
        let now = Utc::now();
        let id = cache_key(namespace, key);

        let mut entries = self.entries.write();
        let entry = match entries.remove(&id) {
            Some(entry) => Some(entry),
            None => self.load_from_backend(namespace, key),
        };
        self.unpersist(namespace, key);

        entry.filter(|e| !e.is_expired(now)).map(|e| e.value)
    }

    /// Applies `f` to the current value of `key` atomically.
    ///
    /// Returning `None` removes the entry. The entry keeps its expiry.
    pub fn update<F>(&self, namespace: &str, key: &str, f: F) -> Option<Value>
    where
        F: FnOnce(Option<Value>) -> Option<Value>,
    {
        let now = Utc::now();
        let id = cache_key(namespace, key);

        let mut entries = self.entries.write();
        let current = self.lookup_locked(&mut entries, namespace, key, now).cloned();
        let expires_at = current.as_ref().and_then(|e| e.expires_at);

        match f(current.map(|e| e.value)) {
            Some(value) => {
                let entry = TransientEntry {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                    value: value.clone(),
                    expires_at,
                };
                self.persist(&entry);
                entries.insert(id, entry);
                Some(value)
            }
            None => {
                entries.remove(&id);
                self.unpersist(namespace, key);
                None
            }
        }
    }

    /// Lists the live keys of `namespace`, sorted.
    pub fn keys(&self, namespace: &str) -> Vec<String> {
        let now = Utc::now();
        let prefix = cache_key(namespace, "");

        let mut keys: BTreeSet<String> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(id, entry)| id.starts_with(&prefix) && !entry.is_expired(now))
                .map(|(_, entry)| entry.key.clone())
                .collect()
        };

        match self.backend.keys(namespace, now) {
            Ok(stored) => keys.extend(stored),
            Err(e) => warn!(namespace, error = %e, "Failed to list stored keys"),
        }

        keys.into_iter().collect()
    }

    /// Removes every expired entry from the cache and the backend.
    ///
    /// Returns the number of cached entries dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            before - entries.len()
        };

        match self.backend.purge_expired(now) {
            Ok(stored) if stored > 0 || removed > 0 => {
                debug!(cached = removed, stored, "Purged expired transient entries");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to purge expired entries from backend"),
        }

        removed
    }

    /// Creates a background purge task.
    ///
    /// Returns a future that should be spawned as a background task.
    pub fn start_expiry_sweep(
        self: Arc<Self>,
        interval: Duration,
    ) -> impl std::future::Future<Output = ()> + Send {
        async move {
            loop {
                tokio::time::sleep(interval).await;
                self.purge_expired();
            }
        }
    }

    /// Finds a live entry in the cache or the backend, caching backend hits
    /// and evicting expired entries. The caller holds the write lock.
    fn lookup_locked<'a>(
        &self,
        entries: &'a mut HashMap<String, TransientEntry>,
        namespace: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a TransientEntry> {
        let id = cache_key(namespace, key);

        if entries.get(&id).is_some_and(|e| e.is_expired(now)) {
            entries.remove(&id);
            self.unpersist(namespace, key);
            return None;
        }

        if !entries.contains_key(&id) {
            let loaded = self.load_from_backend(namespace, key)?;
            if loaded.is_expired(now) {
                self.unpersist(namespace, key);
                return None;
            }
            entries.insert(id.clone(), loaded);
        }

        entries.get(&id)
    }

    fn load_from_backend(&self, namespace: &str, key: &str) -> Option<TransientEntry> {
        match self.backend.load(namespace, key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(namespace, key, error = %e, "Failed to load transient entry");
                None
            }
        }
    }

    fn persist(&self, entry: &TransientEntry) {
        if let Err(e) = self.backend.store(entry) {
            warn!(
                namespace = %entry.namespace,
                key = %entry.key,
                error = %e,
                "Failed to persist transient entry"
            );
        }
    }

    fn unpersist(&self, namespace: &str, key: &str) {
        if let Err(e) = self.backend.delete(namespace, key) {
            warn!(namespace, key, error = %e, "Failed to delete transient entry");
        }
    }
}
