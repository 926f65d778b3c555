//! Feature preferences.
//!
//! Preferences are a bitmask of [`Feature`]s with dependency closure: turning
//! on a feature turns on everything it depends on, turning one off turns off
//! everything that requires it. The mask travels as `prefs` in every session
//! envelope.
//!
//! The browser-side copy lives in the `portal5prefs2` cookie, a base64 JSON
//! object handled by [`CookiePreferences`].

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the preference cookie.
pub const PREFS_COOKIE: &str = "portal5prefs2";

/// Lifetime of the preference cookie, in seconds (one year).
pub const PREFS_COOKIE_MAX_AGE: u64 = 31_536_000;

/// A toggleable proxy feature. The discriminant is its bit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    BasicRewriteCrosssite = 0,
    BasicSetHeaders = 1,
    BasicSetCookies = 2,
    DisambiguationTestUrl = 3,
    SecurityEnforceCors = 4,
    SecurityBreakCsp = 5,
    SecurityClearCookiesOnNavigate = 6,
    InjectionDomHijack = 7,
}

impl Feature {
    /// Returns all features in bit order.
    pub fn all() -> &'static [Feature] {
        &[
            Self::BasicRewriteCrosssite,
            Self::BasicSetHeaders,
            Self::BasicSetCookies,
            Self::DisambiguationTestUrl,
            Self::SecurityEnforceCors,
            Self::SecurityBreakCsp,
            Self::SecurityClearCookiesOnNavigate,
            Self::InjectionDomHijack,
        ]
    }

    /// Returns the feature key, e.g. `basic_rewrite_crosssite`.
    pub fn key(&self) -> &'static str {
        match self {
            Self::BasicRewriteCrosssite => "basic_rewrite_crosssite",
            Self::BasicSetHeaders => "basic_set_headers",
            Self::BasicSetCookies => "basic_set_cookies",
            Self::DisambiguationTestUrl => "disambiguation_test_url",
            Self::SecurityEnforceCors => "security_enforce_cors",
            Self::SecurityBreakCsp => "security_break_csp",
            Self::SecurityClearCookiesOnNavigate => "security_clear_cookies_on_navigate",
            Self::InjectionDomHijack => "injection_dom_hijack",
        }
    }

    /// Looks up a feature by key.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::all().iter().copied().find(|f| f.key() == key)
    }

    /// Returns the bit of this feature.
    pub fn bit(&self) -> u32 {
        1 << (*self as u32)
    }

    /// Features that must be on whenever this one is on.
    pub fn dependencies(&self) -> &'static [Feature] {
        match self {
            Self::SecurityEnforceCors | Self::SecurityBreakCsp => &[Self::BasicSetHeaders],
            Self::InjectionDomHijack => &[
                Self::BasicRewriteCrosssite,
                Self::SecurityBreakCsp,
                Self::BasicSetHeaders,
            ],
            _ => &[],
        }
    }

    /// Features evaluated in the browser rather than on the server.
    pub fn is_client_specific(&self) -> bool {
        matches!(
            self,
            Self::BasicRewriteCrosssite | Self::DisambiguationTestUrl | Self::InjectionDomHijack
        )
    }
}

/// A set of enabled features, closed under dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "PrefsWire", into = "PrefsWire")]
pub struct Preferences(u32);

impl Preferences {
    /// No features enabled.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds preferences from a raw mask, applying dependency closure and
    /// dropping unknown bits.
    pub fn from_mask(mask: u32) -> Self {
        Self(Self::resolve_dependencies(mask & Self::known_bits()))
    }

    /// Builds preferences from a list of features.
    pub fn from_features(features: &[Feature]) -> Self {
        Self::from_mask(features.iter().fold(0, |mask, f| mask | f.bit()))
    }

    /// Returns the raw mask.
    pub fn mask(&self) -> u32 {
        self.0
    }

    /// Returns true if `feature` is enabled.
    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.0 & feature.bit() != 0
    }

    /// Enables a feature and everything it depends on.
    pub fn enable(&mut self, feature: Feature) {
        self.0 = Self::resolve_dependencies(self.0 | feature.bit());
    }

    /// Disables a feature and every feature that requires it.
    pub fn disable(&mut self, feature: Feature) {
        let mut mask = self.0 & !feature.bit();
        for dependent in Feature::all() {
            if Self::closure(dependent.bit()) & feature.bit() != 0 {
                mask &= !dependent.bit();
            }
        }
        self.0 = mask;
    }

    /// Returns the enabled features in bit order.
    pub fn features(&self) -> Vec<Feature> {
        Feature::all()
            .iter()
            .copied()
            .filter(|f| self.is_enabled(*f))
            .collect()
    }

    /// Returns the enabled client-specific features.
    pub fn client_local(&self) -> Vec<Feature> {
        self.features()
            .into_iter()
            .filter(Feature::is_client_specific)
            .collect()
    }

    fn known_bits() -> u32 {
        Feature::all().iter().fold(0, |mask, f| mask | f.bit())
    }

    /// Transitive dependency closure of every bit in `mask`.
    fn closure(mask: u32) -> u32 {
        let mut closed = mask;
        loop {
            let next = Feature::all()
                .iter()
                .filter(|f| closed & f.bit() != 0)
                .flat_map(|f| f.dependencies())
                .fold(closed, |m, dep| m | dep.bit());
            if next == closed {
                return closed;
            }
            closed = next;
        }
    }

    fn resolve_dependencies(mask: u32) -> u32 {
        Self::closure(mask)
    }
}

impl Default for Preferences {
    fn default() -> Self {
        Self::from_features(&[
            Feature::BasicRewriteCrosssite,
            Feature::BasicSetHeaders,
            Feature::BasicSetCookies,
            Feature::DisambiguationTestUrl,
            Feature::SecurityEnforceCors,
            Feature::SecurityClearCookiesOnNavigate,
        ])
    }
}

/// Wire form of preferences: the mask plus the client-specific flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PrefsWire {
    value: u32,
    #[serde(default)]
    local: BTreeMap<String, u8>,
}

impl From<PrefsWire> for Preferences {
    fn from(wire: PrefsWire) -> Self {
        Self::from_mask(wire.value)
    }
}

impl From<Preferences> for PrefsWire {
    fn from(prefs: Preferences) -> Self {
        Self {
            value: prefs.mask(),
            local: prefs
                .client_local()
                .into_iter()
                .map(|f| (f.key().to_string(), 1))
                .collect(),
        }
    }
}

/// A key-value capability for browser-held preferences.
pub trait PreferenceStore {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> Option<&Value>;

    /// Stores `value` under `key`.
    fn set(&mut self, key: &str, value: Value);
}

/// Preferences held in the `portal5prefs2` cookie.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CookiePreferences {
    values: Map<String, Value>,
}

impl CookiePreferences {
    /// Reads the preference cookie from a `Cookie` header value.
    ///
    /// The last occurrence wins; a missing or undecodable cookie yields an
    /// empty store.
    pub fn from_cookie_header(header: &str) -> Self {
        let encoded = header
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .filter(|(key, _)| key.trim() == PREFS_COOKIE)
            .map(|(_, value)| value)
            .last();

        let values = encoded
            .and_then(|value| STANDARD.decode(value.trim()).ok())
            .and_then(|bytes| serde_json::from_slice::<Map<String, Value>>(&bytes).ok())
            .unwrap_or_default();

        Self { values }
    }

    /// Encodes the store as a `Set-Cookie` header value.
    pub fn to_set_cookie(&self) -> String {
        let json = Value::Object(self.values.clone()).to_string();
        format!(
            "{PREFS_COOKIE}={}; path=/; max-age={PREFS_COOKIE_MAX_AGE}; secure",
            STANDARD.encode(json)
        )
    }
}

impl PreferenceStore for CookiePreferences {
    fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }
}
