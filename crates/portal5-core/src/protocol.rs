//! Session protocol.
//!
//! Every proxied exchange carries two headers:
//!
//! - `X-Portal5` on the outbound request: a JSON [`SessionEnvelope`] whose
//!   fields depend on the [`TransmissionMode`].
//! - `X-Portal5-Signal` on the response: a JSON object of one-shot
//!   [`Directive`]s. Persistent directives are merged into the worker-wide
//!   [`DirectiveState`] and consumed by the first eligible request.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::preferences::Preferences;
use crate::request::RequestMode;

/// Request header carrying the session envelope.
pub const SESSION_HEADER: &str = "x-portal5";

/// Response header carrying directives.
pub const DIRECTIVE_HEADER: &str = "x-portal5-signal";

/// Session protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The envelope could not be serialized or parsed.
    #[error("malformed session envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The envelope was valid JSON but not an object.
    #[error("session envelope must be a JSON object")]
    NotAnObject,
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Which envelope fields are transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionMode {
    /// Identifies the worker itself (restricted endpoints).
    Identity,
    /// Describes a proxied request.
    Regular,
    /// Identifies the worker with its shared secret.
    Secret,
}

impl TransmissionMode {
    /// Returns the envelope fields sent in this mode.
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Self::Identity => &["id", "version", "prefs", "signals"],
            Self::Regular => &["version", "prefs", "mode", "origin", "referrer", "signals"],
            Self::Secret => &["id", "version", "prefs", "signals", "secret"],
        }
    }
}

/// The `X-Portal5` envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub prefs: Preferences,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RequestMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default)]
    pub signals: Map<String, Value>,
}

impl SessionEnvelope {
    /// Encodes the envelope as header JSON, keeping only the fields of `mode`.
    pub fn encode(&self, mode: TransmissionMode) -> Result<String> {
        let Value::Object(mut fields) = serde_json::to_value(self)? else {
            return Err(ProtocolError::NotAnObject);
        };
        let allowed = mode.fields();
        fields.retain(|key, value| allowed.contains(&key.as_str()) && !value.is_null());
        Ok(Value::Object(fields).to_string())
    }

    /// Parses header JSON into an envelope.
    pub fn decode(header: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(header)?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Sets the forwarded referrer and, when present, its origin.
    pub fn set_referrer(&mut self, forwarded: Option<String>, origin: Option<String>) {
        self.referrer = forwarded;
        self.origin = origin;
    }

    /// Sets a signal.
    pub fn signal(&mut self, key: &str, value: Value) {
        self.signals.insert(key.to_string(), value);
    }
}

/// Known directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    /// Mark the next eligible request for revalidation.
    RevalidateOnNextRequest,
    /// Inject the DOM rewriter into this response.
    Hijack,
}

impl Directive {
    /// Returns the directive key.
    pub fn key(&self) -> &'static str {
        match self {
            Self::RevalidateOnNextRequest => "revalidate-on-next-request",
            Self::Hijack => "hijack",
        }
    }
}

/// Directives parsed from one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectiveSet {
    entries: BTreeMap<String, Value>,
}

impl DirectiveSet {
    /// Parses a directive header. Absent, malformed or non-object values
    /// yield an empty set.
    pub fn parse(header: Option<&str>) -> Self {
        let entries = header
            .and_then(|raw| serde_json::from_str::<Map<String, Value>>(raw).ok())
            .map(|map| map.into_iter().collect())
            .unwrap_or_default();
        Self { entries }
    }

    /// Returns true if no directive is set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `directive` is present with a truthy value.
    pub fn contains(&self, directive: Directive) -> bool {
        self.entries.get(directive.key()).is_some_and(is_truthy)
    }

    /// Removes `directive`, returning whether it was set.
    pub fn take(&mut self, directive: Directive) -> bool {
        self.entries
            .remove(directive.key())
            .is_some_and(|v| is_truthy(&v))
    }

    /// Inserts a directive.
    pub fn insert(&mut self, directive: Directive) {
        self.entries.insert(directive.key().to_string(), Value::from(1));
    }

    /// Encodes the set as header JSON.
    pub fn to_header(&self) -> String {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map).to_string()
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Worker-scoped directive state shared by all requests.
#[derive(Debug, Default)]
pub struct DirectiveState {
    pending: Mutex<DirectiveSet>,
}

impl DirectiveState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges directives received on a response.
    pub fn merge(&self, incoming: DirectiveSet) {
        if incoming.is_empty() {
            return;
        }
        let mut pending = self.pending.lock();
        pending.entries.extend(incoming.entries);
    }

    /// Atomically consumes `directive`.
    pub fn take(&self, directive: Directive) -> bool {
        self.pending.lock().take(directive)
    }

    /// Returns true if `directive` is pending.
    pub fn contains(&self, directive: Directive) -> bool {
        self.pending.lock().contains(directive)
    }

    /// Applies pending directives to an outbound envelope.
    ///
    /// `revalidate-on-next-request` is only consumed by eligible requests
    /// (`GET` navigations) and sets `signals.revalidate = true` once.
    pub fn apply(&self, envelope: &mut SessionEnvelope, eligible: bool) {
        if eligible && self.take(Directive::RevalidateOnNextRequest) {
            tracing::debug!("Consumed revalidate-on-next-request directive");
            envelope.signal("revalidate", Value::Bool(true));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> SessionEnvelope {
        SessionEnvelope {
            id: Some("worker-1".to_string()),
            version: "0.5.0".to_string(),
            prefs: Preferences::default(),
            mode: Some(RequestMode::Cors),
            origin: Some("https://a.example".to_string()),
            referrer: Some("https://a.example/p".to_string()),
            secret: Some("s3cret".to_string()),
            signals: Map::new(),
        }
    }

    fn keys(encoded: &str) -> Vec<String> {
        let value: Map<String, Value> = serde_json::from_str(encoded).unwrap();
        let mut keys: Vec<String> = value.keys().cloned().collect();
        keys.sort();
        keys
    }

    // ==================== Envelope Tests ====================

    #[test]
    fn test_regular_fields() {
        let encoded = envelope().encode(TransmissionMode::Regular).unwrap();
        assert_eq!(
            keys(&encoded),
            vec!["mode", "origin", "prefs", "referrer", "signals", "version"]
        );
    }

    #[test]
    fn test_identity_fields() {
        let encoded = envelope().encode(TransmissionMode::Identity).unwrap();
        assert_eq!(keys(&encoded), vec!["id", "prefs", "signals", "version"]);
    }

    #[test]
    fn test_secret_fields() {
        let encoded = envelope().encode(TransmissionMode::Secret).unwrap();
        assert_eq!(
            keys(&encoded),
            vec!["id", "prefs", "secret", "signals", "version"]
        );
    }

    #[test]
    fn test_missing_referrer_is_omitted() {
        let mut env = envelope();
        env.set_referrer(None, None);
        let encoded = env.encode(TransmissionMode::Regular).unwrap();
        assert!(!keys(&encoded).contains(&"referrer".to_string()));
        assert!(!keys(&encoded).contains(&"origin".to_string()));
    }

    #[test]
    fn test_decode() {
        let encoded = envelope().encode(TransmissionMode::Regular).unwrap();
        let decoded = SessionEnvelope::decode(&encoded).unwrap();
        assert_eq!(decoded.mode, Some(RequestMode::Cors));
        assert_eq!(decoded.referrer.as_deref(), Some("https://a.example/p"));
        assert_eq!(decoded.id, None);
        assert!(matches!(
            SessionEnvelope::decode("[1]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(SessionEnvelope::decode("{").is_err());
    }

    // ==================== Directive Tests ====================

    #[test]
    fn test_directive_parse() {
        let set = DirectiveSet::parse(Some(r#"{"revalidate-on-next-request": 1, "hijack": 0}"#));
        assert!(set.contains(Directive::RevalidateOnNextRequest));
        assert!(!set.contains(Directive::Hijack));
    }

    #[test]
    fn test_directive_parse_never_fails() {
        assert!(DirectiveSet::parse(None).is_empty());
        assert!(DirectiveSet::parse(Some("not json")).is_empty());
        assert!(DirectiveSet::parse(Some("[1, 2]")).is_empty());
    }

    #[test]
    fn test_directive_take_is_once() {
        let mut set = DirectiveSet::default();
        set.insert(Directive::Hijack);
        assert_eq!(set.to_header(), r#"{"hijack":1}"#);
        assert!(set.take(Directive::Hijack));
        assert!(!set.take(Directive::Hijack));
    }

    #[test]
    fn test_revalidate_applies_exactly_once() {
        let state = DirectiveState::new();
        state.merge(DirectiveSet::parse(Some(
            r#"{"revalidate-on-next-request": 1}"#,
        )));

        let mut ineligible = envelope();
        state.apply(&mut ineligible, false);
        assert!(ineligible.signals.is_empty());

        let mut first = envelope();
        state.apply(&mut first, true);
        assert_eq!(first.signals.get("revalidate"), Some(&json!(true)));

        let mut second = envelope();
        state.apply(&mut second, true);
        assert!(second.signals.is_empty());
        assert!(!state.contains(Directive::RevalidateOnNextRequest));
    }
}
