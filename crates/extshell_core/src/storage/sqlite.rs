//! SQLite-backed `KeyValueStore`.
//!
//! # Invariants
//! - Every row lives under one namespace so several stores can share a file.
//! - Writes are single statements; SQLite provides atomicity per call.

use super::{KeyValueStore, StorageResult};
use crate::db::{open_db, open_db_in_memory};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Namespace used by the extension registry.
pub const REGISTRY_NAMESPACE: &str = "registry";

pub struct SqliteStore {
    conn: Connection,
    namespace: String,
}

impl SqliteStore {
    /// Wraps an already migrated connection.
    pub fn new(conn: Connection, namespace: impl Into<String>) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
        }
    }

    /// Opens (and migrates) a database file for the registry namespace.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Ok(Self::new(open_db(path)?, REGISTRY_NAMESPACE))
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Ok(Self::new(open_db_in_memory()?, REGISTRY_NAMESPACE))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv_entries WHERE namespace = ?1 AND key = ?2;",
                params![self.namespace, key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&mut self, key: &str, value: &str) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO kv_entries (namespace, key, value)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                updated_at = (strftime('%s', 'now') * 1000);",
            params![self.namespace, key, value],
        )?;
        Ok(())
    }

    fn get_all(&self) -> StorageResult<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value FROM kv_entries WHERE namespace = ?1 ORDER BY key ASC;",
        )?;
        let mut rows = stmt.query([self.namespace.as_str()])?;
        let mut values = Vec::new();
        while let Some(row) = rows.next()? {
            values.push((row.get(0)?, row.get(1)?));
        }
        Ok(values)
    }

    fn delete(&mut self, key: &str) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2;",
            params![self.namespace, key],
        )?;
        Ok(())
    }

    fn clear(&mut self) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM kv_entries WHERE namespace = ?1;",
            [self.namespace.as_str()],
        )?;
        Ok(())
    }
}
