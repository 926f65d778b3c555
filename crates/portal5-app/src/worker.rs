//! Worker identity, persisted across restarts.

use portal5_core::WorkerSettings;
use portal5_storage::Database;
use tracing::info;

use crate::config::{ConfigError, PortalConfig};

/// Builds the worker settings for this run and persists them.
///
/// The id and secret survive restarts unless the configuration pins them.
/// Version, origin and preferences always come from the configuration.
pub fn resolve_settings(
    db: &Database,
    config: &PortalConfig,
) -> Result<WorkerSettings, ConfigError> {
    let stored = db.load_settings()?;

    let id = config
        .id
        .clone()
        .or_else(|| stored.as_ref().map(|s| s.id.clone()))
        .unwrap_or_else(|| format!("{:016x}", rand::random::<u64>()));
    let secret = config
        .secret
        .clone()
        .or_else(|| stored.as_ref().and_then(|s| s.secret.clone()))
        .unwrap_or_else(|| format!("{:032x}", rand::random::<u128>()));

    let mut settings = WorkerSettings::new(id, config.version.clone(), config.origin()?)
        .with_secret(secret)
        .with_prefs(config.preferences());
    if let Some(stored) = stored {
        settings.signals = stored.signals;
    } else {
        info!(id = %settings.id, "Created new worker identity");
    }

    db.save_settings(&settings)?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portal5.db");
        let config = PortalConfig::default();

        let first = {
            let db = Database::with_path(&path).unwrap();
            resolve_settings(&db, &config).unwrap()
        };
        let db = Database::with_path(&path).unwrap();
        let second = resolve_settings(&db, &config).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.secret, second.secret);
        assert_eq!(first.id.len(), 16);
    }

    #[test]
    fn test_config_pins_identity() {
        let db = Database::in_memory().unwrap();
        resolve_settings(&db, &PortalConfig::default()).unwrap();

        let config = PortalConfig {
            id: Some("worker-7".to_string()),
            secret: Some("s3cret".to_string()),
            server_origin: "https://proxy.example".to_string(),
            ..PortalConfig::default()
        };
        let settings = resolve_settings(&db, &config).unwrap();

        assert_eq!(settings.id, "worker-7");
        assert_eq!(settings.secret.as_deref(), Some("s3cret"));
        assert_eq!(settings.origin.as_str(), "https://proxy.example");
        assert_eq!(db.load_settings().unwrap(), Some(settings));
    }
}
