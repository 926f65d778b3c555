//! Worker settings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::preferences::Preferences;
use crate::protocol::SessionEnvelope;
use crate::synthesis::ServerOrigin;

/// Identity and preferences of the intercepting worker.
///
/// Persisted between runs so the worker keeps its id and secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Worker id sent in identity and secret envelopes.
    pub id: String,
    /// Worker version.
    pub version: String,
    /// Shared secret for the secret transmission mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Enabled features.
    #[serde(default)]
    pub prefs: Preferences,
    /// Signals sent with every envelope.
    #[serde(default)]
    pub signals: Map<String, Value>,
    /// The proxy origin.
    pub origin: ServerOrigin,
}

impl WorkerSettings {
    /// Creates settings with default preferences and no secret.
    pub fn new(id: impl Into<String>, version: impl Into<String>, origin: ServerOrigin) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            secret: None,
            prefs: Preferences::default(),
            signals: Map::new(),
            origin,
        }
    }

    /// Sets the shared secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Sets the preferences.
    pub fn with_prefs(mut self, prefs: Preferences) -> Self {
        self.prefs = prefs;
        self
    }

    /// Returns a fresh envelope seeded from these settings.
    pub fn envelope(&self) -> SessionEnvelope {
        SessionEnvelope {
            id: Some(self.id.clone()),
            version: self.version.clone(),
            prefs: self.prefs,
            secret: self.secret.clone(),
            signals: self.signals.clone(),
            ..SessionEnvelope::default()
        }
    }
}
