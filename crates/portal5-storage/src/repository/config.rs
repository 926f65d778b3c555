//! Configuration repository.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::models::Config;

/// Repository for the `config` table.
pub struct ConfigRepo;

impl ConfigRepo {
    /// Get a configuration value.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Config>> {
        let raw: Option<String> = conn
            .query_row("SELECT value FROM config WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;

        match raw {
            Some(value) => Ok(Some(Config {
                key: key.to_string(),
                value: serde_json::from_str(&value)?,
            })),
            None => Ok(None),
        }
    }

    /// Set a configuration value (insert or update).
    pub fn set(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    /// Delete a configuration value.
    pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM config WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    /// Read a typed value; a missing key yields `None`.
    pub fn get_typed<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>> {
        match Self::get(conn, key)? {
            Some(config) => Ok(Some(serde_json::from_value(config.value)?)),
            None => Ok(None),
        }
    }

    /// Store a typed value.
    pub fn set_typed<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<()> {
        Self::set(conn, key, &serde_json::to_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;
    use serde::Deserialize;
    use serde_json::json;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_set_and_get() {
        let conn = setup_db();
        ConfigRepo::set(&conn, "worker", &json!({"id": "w1"})).unwrap();
        let config = ConfigRepo::get(&conn, "worker").unwrap().unwrap();
        assert_eq!(config.key, "worker");
        assert_eq!(config.value["id"], "w1");
    }

    #[test]
    fn test_update_existing() {
        let conn = setup_db();
        ConfigRepo::set(&conn, "key", &json!("original")).unwrap();
        ConfigRepo::set(&conn, "key", &json!("updated")).unwrap();
        let config = ConfigRepo::get(&conn, "key").unwrap().unwrap();
        assert_eq!(config.value, json!("updated"));
    }

    #[test]
    fn test_delete() {
        let conn = setup_db();
        ConfigRepo::set(&conn, "gone", &json!(1)).unwrap();
        assert!(ConfigRepo::delete(&conn, "gone").unwrap());
        assert!(!ConfigRepo::delete(&conn, "gone").unwrap());
        assert!(ConfigRepo::get(&conn, "gone").unwrap().is_none());
    }

    #[test]
    fn test_typed_values() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Worker {
            id: String,
            version: String,
        }

        let conn = setup_db();
        assert!(ConfigRepo::get_typed::<Worker>(&conn, "worker").unwrap().is_none());

        let worker = Worker {
            id: "w1".to_string(),
            version: "0.5.0".to_string(),
        };
        ConfigRepo::set_typed(&conn, "worker", &worker).unwrap();
        assert_eq!(ConfigRepo::get_typed(&conn, "worker").unwrap(), Some(worker));
    }

    #[test]
    fn test_corrupt_value_is_an_error() {
        let conn = setup_db();
        conn.execute("INSERT INTO config (key, value) VALUES ('bad', '{')", [])
            .unwrap();
        assert!(ConfigRepo::get(&conn, "bad").is_err());
    }
}
