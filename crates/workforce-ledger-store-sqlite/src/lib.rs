#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;
use workforce_ledger_core::{format_rfc3339, now_utc, CollectionStore};

const COLLECTIONS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_COLLECTIONS_V1: &str = r"
CREATE TABLE IF NOT EXISTS collections (
  collection_key TEXT PRIMARY KEY,
  payload_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// One persisted collection as seen by the database, without decoding its payload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StoredCollection {
    pub collection_key: String,
    pub payload_bytes: usize,
    pub updated_at: String,
}

/// [`CollectionStore`] backed by a single SQLite table, one row per collection.
pub struct SqliteCollectionStore {
    conn: Connection,
}

impl SqliteCollectionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        debug!(path = %path.display(), "sqlite collection store opened");
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_COLLECTIONS_V1)
            .context("failed to apply collections schema")?;

        let now = timestamp()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![COLLECTIONS_MIGRATION_VERSION, now],
            )
            .context("failed to register collections schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to read schema version")
    }

    pub fn stored_collections(&self) -> Result<Vec<StoredCollection>> {
        let mut stmt = self.conn.prepare(
            "SELECT collection_key, length(payload_json), updated_at
             FROM collections ORDER BY collection_key ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut collections = Vec::new();
        while let Some(row) = rows.next()? {
            let bytes: i64 = row.get(1)?;
            collections.push(StoredCollection {
                collection_key: row.get(0)?,
                payload_bytes: usize::try_from(bytes)
                    .with_context(|| format!("invalid payload length: {bytes}"))?,
                updated_at: row.get(2)?,
            });
        }
        Ok(collections)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl CollectionStore for SqliteCollectionStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM collections WHERE collection_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read collection {key}"))?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        let value = serde_json::from_str(&payload)
            .with_context(|| format!("invalid stored JSON for collection {key}"))?;
        Ok(Some(value))
    }

    fn save(&mut self, key: &str, value: &Value) -> Result<()> {
        let payload = serde_json::to_string(value)
            .with_context(|| format!("failed to serialize collection {key}"))?;
        let now = timestamp()?;

        self.conn
            .execute(
                "INSERT INTO collections(collection_key, payload_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(collection_key) DO UPDATE SET
                   payload_json = excluded.payload_json,
                   updated_at = excluded.updated_at",
                params![key, payload, now],
            )
            .with_context(|| format!("failed to upsert collection {key}"))?;

        debug!(collection = key, bytes = payload.len(), "collection row written");
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM collections WHERE collection_key = ?1",
                params![key],
            )
            .with_context(|| format!("failed to delete collection {key}"))?;

        debug!(collection = key, removed, "collection row deleted");
        Ok(())
    }
}

fn timestamp() -> Result<String> {
    format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))
}
