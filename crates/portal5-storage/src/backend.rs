//! Persistence backends for the transient store.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::TransientEntry;

/// Durable storage behind [`TransientStore`](crate::TransientStore).
///
/// Implementations are synchronous; every call is a short statement.
pub trait KvBackend: Send + Sync {
    /// Loads an entry, expired or not.
    fn load(&self, namespace: &str, key: &str) -> Result<Option<TransientEntry>>;

    /// Stores or replaces an entry.
    fn store(&self, entry: &TransientEntry) -> Result<()>;

    /// Deletes an entry.
    fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    /// Lists the keys of a namespace that are live at `now`.
    fn keys(&self, namespace: &str, now: DateTime<Utc>) -> Result<Vec<String>>;

    /// Deletes entries expired at `now`, returning how many were removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// A backend that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackend;

impl KvBackend for NoopBackend {
    fn load(&self, _namespace: &str, _key: &str) -> Result<Option<TransientEntry>> {
        Ok(None)
    }

    fn store(&self, _entry: &TransientEntry) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _namespace: &str, _key: &str) -> Result<()> {
        Ok(())
    }

    fn keys(&self, _namespace: &str, _now: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }
}
