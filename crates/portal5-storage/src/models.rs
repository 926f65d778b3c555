//! Data models for storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A configuration key-value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration key.
    pub key: String,
    /// Configuration value (JSON).
    pub value: serde_json::Value,
}

/// An entry of the transient store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransientEntry {
    /// Namespace, e.g. `client` or `request`.
    pub namespace: String,
    /// Key within the namespace.
    pub key: String,
    /// Stored value (JSON).
    pub value: serde_json::Value,
    /// When the entry stops being visible, if ever.
    pub expires_at: Option<DateTime<Utc>>,
}

impl TransientEntry {
    /// Returns true if the entry has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
