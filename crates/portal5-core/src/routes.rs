//! Static route and passthrough tables.
//!
//! A route is an exact proxy path bound to a [`RouteHandler`] plus a test the
//! request must satisfy. Handler names are resolved when the configuration is
//! loaded, so a typo fails at startup instead of at request time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::request::RequestMode;

/// Route configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteConfigError {
    #[error("unknown route handler '{0}'")]
    UnknownHandler(String),

    #[error("unknown request mode '{0}'")]
    UnknownMode(String),

    #[error("route path must start with '/': '{0}'")]
    InvalidPath(String),
}

/// What to do with a request matching a static route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteHandler {
    /// Forward unchanged.
    Passthrough,
    /// Refuse with 403.
    Forbidden,
    /// Forward with the worker's identity envelope (document navigations only).
    Restricted,
    /// Resume a parked request after the user picked a destination.
    Disambiguate,
}

impl RouteHandler {
    /// Returns the handler name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Forbidden => "forbidden",
            Self::Restricted => "restricted",
            Self::Disambiguate => "disambiguate",
        }
    }
}

impl FromStr for RouteHandler {
    type Err = RouteConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passthrough" => Ok(Self::Passthrough),
            "forbidden" => Ok(Self::Forbidden),
            "restricted" => Ok(Self::Restricted),
            "disambiguate" => Ok(Self::Disambiguate),
            other => Err(RouteConfigError::UnknownHandler(other.to_string())),
        }
    }
}

fn default_modes() -> Vec<String> {
    vec!["navigate".to_string()]
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string(), "POST".to_string()]
}

fn default_true() -> bool {
    true
}

/// A route rule as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRuleConfig {
    pub handler: String,
    #[serde(default = "default_modes")]
    pub modes: Vec<String>,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    /// Only match requests without a referrer.
    #[serde(default = "default_true")]
    pub require_empty_referrer: bool,
}

impl RouteRuleConfig {
    /// Creates a rule config with the default test.
    pub fn new(handler: &str) -> Self {
        Self {
            handler: handler.to_string(),
            modes: default_modes(),
            methods: default_methods(),
            require_empty_referrer: true,
        }
    }
}

/// A resolved route rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub handler: RouteHandler,
    pub modes: Vec<RequestMode>,
    pub methods: Vec<String>,
    pub require_empty_referrer: bool,
}

impl RouteRule {
    /// Creates a rule with the default test: `GET`/`POST` navigations
    /// without a referrer.
    pub fn new(handler: RouteHandler) -> Self {
        Self {
            handler,
            modes: vec![RequestMode::Navigate],
            methods: default_methods(),
            require_empty_referrer: true,
        }
    }

    /// Resolves a configured rule.
    pub fn from_config(config: &RouteRuleConfig) -> Result<Self, RouteConfigError> {
        let handler = config.handler.parse()?;
        let modes = config
            .modes
            .iter()
            .map(|m| RequestMode::parse(m).ok_or_else(|| RouteConfigError::UnknownMode(m.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        let methods = config
            .methods
            .iter()
            .map(|m| m.to_ascii_uppercase())
            .collect();

        Ok(Self {
            handler,
            modes,
            methods,
            require_empty_referrer: config.require_empty_referrer,
        })
    }

    /// Returns true if the request satisfies this rule's test.
    pub fn matches(&self, mode: RequestMode, method: &str, has_referrer: bool) -> bool {
        self.modes.contains(&mode)
            && self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
            && !(self.require_empty_referrer && has_referrer)
    }
}

/// Exact-path table of static routes.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: HashMap<String, RouteRule>,
}

impl RouteTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the table of built-in endpoints.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.insert("/~disambiguate", RouteRule::new(RouteHandler::Disambiguate));
        table.insert("/~multiple-choices", RouteRule::new(RouteHandler::Passthrough));
        table.insert("/~deflect", RouteRule::new(RouteHandler::Passthrough));
        table.insert("/~reset", RouteRule::new(RouteHandler::Passthrough));
        table.insert("/~uninstall", RouteRule::new(RouteHandler::Passthrough));
        table.insert("/init", RouteRule::new(RouteHandler::Passthrough));
        table.insert("/settings", RouteRule::new(RouteHandler::Restricted));
        table
    }

    /// Builds a table from configuration, rejecting unknown handlers.
    pub fn from_config(
        routes: &BTreeMap<String, RouteRuleConfig>,
    ) -> Result<Self, RouteConfigError> {
        let mut table = Self::new();
        for (path, config) in routes {
            if !path.starts_with('/') {
                return Err(RouteConfigError::InvalidPath(path.clone()));
            }
            table.insert(path, RouteRule::from_config(config)?);
        }
        Ok(table)
    }

    /// Adds or replaces the rule for `path`.
    pub fn insert(&mut self, path: &str, rule: RouteRule) {
        self.rules.insert(path.to_string(), rule);
    }

    /// Merges `other` into this table; its rules win.
    pub fn extend(&mut self, other: RouteTable) {
        self.rules.extend(other.rules);
    }

    /// Returns the rule registered for `path`.
    pub fn get(&self, path: &str) -> Option<&RouteRule> {
        self.rules.get(path)
    }

    /// Returns the handler for a request, if its path is routed and the
    /// request passes the rule's test.
    pub fn lookup(
        &self,
        path: &str,
        mode: RequestMode,
        method: &str,
        has_referrer: bool,
    ) -> Option<RouteHandler> {
        self.rules
            .get(path)
            .filter(|rule| rule.matches(mode, method, has_referrer))
            .map(|rule| rule.handler)
    }

    /// Returns the number of routes.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Destinations forwarded without rewriting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassthroughTable {
    /// Exact host names.
    #[serde(default)]
    pub domains: HashSet<String>,
    /// Exact URLs.
    #[serde(default)]
    pub urls: HashSet<String>,
}

impl PassthroughTable {
    /// Returns true if `url`'s host or full href is listed.
    pub fn matches(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| self.domains.contains(host))
            || self.urls.contains(url.as_str())
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.urls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_names() {
        for name in ["passthrough", "forbidden", "restricted", "disambiguate"] {
            let handler: RouteHandler = name.parse().unwrap();
            assert_eq!(handler.as_str(), name);
        }
        assert_eq!(
            "redirect".parse::<RouteHandler>(),
            Err(RouteConfigError::UnknownHandler("redirect".to_string()))
        );
    }

    #[test]
    fn test_default_rule_test() {
        let rule = RouteRule::new(RouteHandler::Forbidden);
        assert!(rule.matches(RequestMode::Navigate, "GET", false));
        assert!(rule.matches(RequestMode::Navigate, "post", false));
        assert!(!rule.matches(RequestMode::Navigate, "PUT", false));
        assert!(!rule.matches(RequestMode::Cors, "GET", false));
        assert!(!rule.matches(RequestMode::Navigate, "GET", true));
    }

    #[test]
    fn test_from_config_rejects_unknown_handler() {
        let mut routes = BTreeMap::new();
        routes.insert("/admin".to_string(), RouteRuleConfig::new("forbidden"));
        routes.insert("/x".to_string(), RouteRuleConfig::new("teleport"));
        assert_eq!(
            RouteTable::from_config(&routes).unwrap_err(),
            RouteConfigError::UnknownHandler("teleport".to_string())
        );
    }

    #[test]
    fn test_from_config_rejects_bad_mode_and_path() {
        let mut routes = BTreeMap::new();
        let mut rule = RouteRuleConfig::new("forbidden");
        rule.modes = vec!["sideways".to_string()];
        routes.insert("/admin".to_string(), rule);
        assert_eq!(
            RouteTable::from_config(&routes).unwrap_err(),
            RouteConfigError::UnknownMode("sideways".to_string())
        );

        let mut routes = BTreeMap::new();
        routes.insert("admin".to_string(), RouteRuleConfig::new("forbidden"));
        assert!(matches!(
            RouteTable::from_config(&routes),
            Err(RouteConfigError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_rule_config_defaults_from_json() {
        let config: RouteRuleConfig = serde_json::from_str(r#"{"handler": "forbidden"}"#).unwrap();
        assert_eq!(config, RouteRuleConfig::new("forbidden"));
    }

    #[test]
    fn test_lookup() {
        let mut table = RouteTable::with_defaults();
        let mut routes = BTreeMap::new();
        let mut api = RouteRuleConfig::new("forbidden");
        api.modes = vec!["cors".to_string(), "navigate".to_string()];
        api.require_empty_referrer = false;
        routes.insert("/api".to_string(), api);
        table.extend(RouteTable::from_config(&routes).unwrap());

        assert_eq!(
            table.lookup("/api", RequestMode::Cors, "GET", true),
            Some(RouteHandler::Forbidden)
        );
        assert_eq!(
            table.lookup("/~disambiguate", RequestMode::Navigate, "POST", false),
            Some(RouteHandler::Disambiguate)
        );
        assert_eq!(table.lookup("/~disambiguate", RequestMode::Cors, "POST", false), None);
        assert_eq!(table.lookup("/other", RequestMode::Navigate, "GET", false), None);
    }

    #[test]
    fn test_default_routes() {
        let table = RouteTable::with_defaults();
        for path in ["/~reset", "/~uninstall", "/init", "/~deflect", "/~multiple-choices"] {
            assert_eq!(
                table.lookup(path, RequestMode::Navigate, "GET", false),
                Some(RouteHandler::Passthrough),
                "{path}"
            );
        }
        assert_eq!(
            table.lookup("/settings", RequestMode::Navigate, "POST", false),
            Some(RouteHandler::Restricted)
        );
    }

    #[test]
    fn test_passthrough_table() {
        let mut table = PassthroughTable::default();
        assert!(table.is_empty());
        table.domains.insert("static.example".to_string());
        table.urls.insert("https://a.example/exact?x=1".to_string());

        assert!(table.matches(&Url::parse("https://static.example/any/path").unwrap()));
        assert!(table.matches(&Url::parse("https://a.example/exact?x=1").unwrap()));
        assert!(!table.matches(&Url::parse("https://a.example/exact").unwrap()));
        assert!(!table.matches(&Url::parse("https://sub.static.example/").unwrap()));
    }
}
