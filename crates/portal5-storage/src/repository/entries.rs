//! Transient entries repository.
//!
//! Expiry timestamps are stored as fixed-width RFC 3339 UTC strings so they
//! compare correctly as text.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, StorageError};
use crate::models::TransientEntry;

fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StorageError::Timestamp(raw.to_string()))
}

/// Raw columns of one row, decoded outside the rusqlite closure.
struct RawEntry {
    namespace: String,
    key: String,
    value: String,
    expires_at: Option<String>,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            namespace: row.get(0)?,
            key: row.get(1)?,
            value: row.get(2)?,
            expires_at: row.get(3)?,
        })
    }

    fn decode(self) -> Result<TransientEntry> {
        Ok(TransientEntry {
            namespace: self.namespace,
            key: self.key,
            value: serde_json::from_str(&self.value)?,
            expires_at: self.expires_at.as_deref().map(decode_time).transpose()?,
        })
    }
}

/// Repository for the `transient_entries` table.
pub struct EntriesRepo;

impl EntriesRepo {
    /// Insert or replace an entry.
    pub fn upsert(conn: &Connection, entry: &TransientEntry) -> Result<()> {
        conn.execute(
            "INSERT INTO transient_entries (namespace, key, value, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at",
            params![
                entry.namespace,
                entry.key,
                serde_json::to_string(&entry.value)?,
                entry.expires_at.map(encode_time),
            ],
        )?;
        Ok(())
    }

    /// Get an entry, expired or not.
    pub fn get(conn: &Connection, namespace: &str, key: &str) -> Result<Option<TransientEntry>> {
        let raw = conn
            .query_row(
                "SELECT namespace, key, value, expires_at FROM transient_entries
                 WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                RawEntry::from_row,
            )
            .optional()?;

        raw.map(RawEntry::decode).transpose()
    }

    /// Delete an entry. Returns true if it existed.
    pub fn delete(conn: &Connection, namespace: &str, key: &str) -> Result<bool> {
        let deleted = conn.execute(
            "DELETE FROM transient_entries WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(deleted > 0)
    }

    /// List the keys of a namespace that are live at `now`.
    pub fn keys(conn: &Connection, namespace: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT key FROM transient_entries
             WHERE namespace = ?1 AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY key",
        )?;
        let keys = stmt
            .query_map(params![namespace, encode_time(now)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    /// Delete every entry expired at `now`. Returns the number removed.
    pub fn delete_expired(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
        let deleted = conn.execute(
            "DELETE FROM transient_entries
             WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            [encode_time(now)],
        )?;
        Ok(deleted)
    }
}
