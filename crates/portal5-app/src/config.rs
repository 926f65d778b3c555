//! Application configuration.
//!
//! Read from a JSON file given with `--config`. Every field has a default,
//! so an empty object (or no file at all) is a valid configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use portal5_core::routes::{PassthroughTable, RouteConfigError, RouteRuleConfig, RouteTable};
use portal5_core::{Feature, Preferences, ServerOrigin};
use portal5_proxy::disambiguation::DEFAULT_PROBE_TIMEOUT;
use portal5_proxy::{ProbePolicy, DEFAULT_HEARTBEAT_TIMEOUT};
use portal5_server::{DEFAULT_HOST, DEFAULT_PORT};
use portal5_storage::client_records::{DEFAULT_RECORD_CAP, DEFAULT_SWEEP_INTERVAL};
use portal5_storage::transient::DEFAULT_PURGE_INTERVAL;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid server origin '{0}'")]
    InvalidOrigin(String),

    #[error("invalid backend url '{0}'")]
    InvalidBackend(String),

    #[error("invalid route table: {0}")]
    Routes(#[from] RouteConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] portal5_storage::StorageError),
}

/// Everything the binary can be configured with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub host: String,
    pub port: u16,
    /// Public origin browsers use to reach the proxy.
    pub server_origin: String,
    /// Origin-fetching backend that receives outbound requests.
    pub backend: String,
    pub version: String,
    /// Worker id. Generated and persisted when unset.
    pub id: Option<String>,
    /// Shared secret. Generated and persisted when unset.
    pub secret: Option<String>,
    /// Enabled features. `None` keeps the defaults.
    pub features: Option<Vec<Feature>>,
    /// Extra static routes, merged over the built-in ones.
    pub routes: BTreeMap<String, RouteRuleConfig>,
    pub passthrough: PassthroughTable,
    /// Inclusive status ranges that pass a disambiguation probe.
    pub probe_accept: Vec<(u16, u16)>,
    pub probe_timeout_secs: u64,
    pub record_cap: usize,
    pub sweep_interval_secs: u64,
    pub purge_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    /// SQLite database path. `None` uses the platform data directory.
    pub db_path: Option<PathBuf>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            server_origin: format!("http://{DEFAULT_HOST}:{DEFAULT_PORT}"),
            backend: "http://127.0.0.1:5000".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            id: None,
            secret: None,
            features: None,
            routes: BTreeMap::new(),
            passthrough: PassthroughTable::default(),
            probe_accept: ProbePolicy::default().accept,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT.as_secs(),
            record_cap: DEFAULT_RECORD_CAP,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            purge_interval_secs: DEFAULT_PURGE_INTERVAL.as_secs(),
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT.as_secs(),
            db_path: None,
        }
    }
}

impl PortalConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field that can only be validated after parsing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.origin()?;
        self.backend_url()?;
        self.route_table()?;
        Ok(())
    }

    /// Returns the public server origin.
    pub fn origin(&self) -> Result<ServerOrigin, ConfigError> {
        ServerOrigin::parse(&self.server_origin)
            .map_err(|_| ConfigError::InvalidOrigin(self.server_origin.clone()))
    }

    /// Returns the backend URL.
    pub fn backend_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.backend).map_err(|_| ConfigError::InvalidBackend(self.backend.clone()))
    }

    /// Returns the configured preferences.
    pub fn preferences(&self) -> Preferences {
        match &self.features {
            Some(features) => Preferences::from_features(features),
            None => Preferences::default(),
        }
    }

    /// Returns the built-in routes with the configured ones merged over them.
    pub fn route_table(&self) -> Result<RouteTable, ConfigError> {
        let mut table = RouteTable::with_defaults();
        table.extend(RouteTable::from_config(&self.routes)?);
        Ok(table)
    }

    pub fn probe_policy(&self) -> ProbePolicy {
        ProbePolicy {
            accept: self.probe_accept.clone(),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}
