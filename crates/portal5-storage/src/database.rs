//! High-level database interface.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use portal5_core::WorkerSettings;
use tracing::info;

use crate::backend::KvBackend;
use crate::error::{Result, StorageError};
use crate::models::{Config, TransientEntry};
use crate::pool::ConnectionPool;
use crate::repository::{ConfigRepo, EntriesRepo};

/// Config key holding the persisted worker settings.
pub const SETTINGS_KEY: &str = "worker_settings";

/// High-level database interface for Portal5.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Create a new database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Create a new database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!(path = %path.display(), "Opening database");
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "portal5", "portal5")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().join("portal5.db"))
    }

    // === Config ===

    /// Get a configuration value.
    pub fn get_config(&self, key: &str) -> Result<Option<Config>> {
        ConfigRepo::get(&self.pool.get(), key)
    }

    /// Set a configuration value.
    pub fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        ConfigRepo::set(&self.pool.get(), key, value)
    }

    /// Delete a configuration value.
    pub fn delete_config(&self, key: &str) -> Result<bool> {
        ConfigRepo::delete(&self.pool.get(), key)
    }

    // === Worker settings ===

    /// Load the persisted worker settings.
    pub fn load_settings(&self) -> Result<Option<WorkerSettings>> {
        ConfigRepo::get_typed(&self.pool.get(), SETTINGS_KEY)
    }

    /// Persist the worker settings.
    pub fn save_settings(&self, settings: &WorkerSettings) -> Result<()> {
        ConfigRepo::set_typed(&self.pool.get(), SETTINGS_KEY, settings)
    }

    // === Transient entries ===

    /// Get a transient entry.
    pub fn get_entry(&self, namespace: &str, key: &str) -> Result<Option<TransientEntry>> {
        EntriesRepo::get(&self.pool.get(), namespace, key)
    }

    /// Insert or replace a transient entry.
    pub fn put_entry(&self, entry: &TransientEntry) -> Result<()> {
        EntriesRepo::upsert(&self.pool.get(), entry)
    }

    /// Delete a transient entry.
    pub fn delete_entry(&self, namespace: &str, key: &str) -> Result<bool> {
        EntriesRepo::delete(&self.pool.get(), namespace, key)
    }

    /// List the live keys of a namespace.
    pub fn entry_keys(&self, namespace: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        EntriesRepo::keys(&self.pool.get(), namespace, now)
    }

    /// Delete expired transient entries.
    pub fn delete_expired_entries(&self, now: DateTime<Utc>) -> Result<usize> {
        EntriesRepo::delete_expired(&self.pool.get(), now)
    }
}

impl KvBackend for Database {
    fn load(&self, namespace: &str, key: &str) -> Result<Option<TransientEntry>> {
        self.get_entry(namespace, key)
    }

    fn store(&self, entry: &TransientEntry) -> Result<()> {
        self.put_entry(entry)
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.delete_entry(namespace, key).map(|_| ())
    }

    fn keys(&self, namespace: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.entry_keys(namespace, now)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.delete_expired_entries(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal5_core::ServerOrigin;
    use serde_json::json;

    #[test]
    fn test_config_roundtrip() {
        let db = Database::in_memory().unwrap();
        db.set_config("k", &json!([1, 2])).unwrap();
        assert_eq!(db.get_config("k").unwrap().unwrap().value, json!([1, 2]));
        assert!(db.delete_config("k").unwrap());
    }

    #[test]
    fn test_settings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("portal5.db");
        let origin = ServerOrigin::parse("https://proxy.example").unwrap();
        let settings = WorkerSettings::new("w1", "0.5.0", origin).with_secret("s");

        {
            let db = Database::with_path(&path).unwrap();
            assert!(db.load_settings().unwrap().is_none());
            db.save_settings(&settings).unwrap();
        }

        let db = Database::with_path(&path).unwrap();
        assert_eq!(db.load_settings().unwrap(), Some(settings));
    }

    #[test]
    fn test_database_as_backend() {
        let db = Database::in_memory().unwrap();
        let backend: &dyn KvBackend = &db;
        let entry = TransientEntry {
            namespace: "client".to_string(),
            key: "ctx".to_string(),
            value: json!(1),
            expires_at: None,
        };
        backend.store(&entry).unwrap();
        assert_eq!(backend.load("client", "ctx").unwrap(), Some(entry));
        assert_eq!(backend.keys("client", Utc::now()).unwrap(), vec!["ctx"]);
        backend.delete("client", "ctx").unwrap();
        assert!(backend.load("client", "ctx").unwrap().is_none());
    }
}
