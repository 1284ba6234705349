//! SQLite-backed template store.

use chrono::Utc;
use facegate_core::{Embedding, StoreError, TemplateStore};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS templates (
    identity    TEXT PRIMARY KEY NOT NULL,
    template_id TEXT NOT NULL,
    embedding   BLOB NOT NULL,
    dimension   INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
";

/// Metadata for one stored template. The embedding itself never leaves the daemon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateRecord {
    pub identity: String,
    pub template_id: String,
    pub dimension: usize,
    pub created_at: String,
    pub updated_at: String,
}

pub struct SqliteTemplateStore {
    conn: Connection,
}

impl SqliteTemplateStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(backend)?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self { conn })
    }

    pub fn remove(&mut self, identity: &str) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM templates WHERE identity = ?1", params![identity])
            .map_err(backend)?;
        Ok(n > 0)
    }

    pub fn record(&self, identity: &str) -> Result<Option<TemplateRecord>, StoreError> {
        self.conn
            .query_row(
                "SELECT identity, template_id, dimension, created_at, updated_at
                 FROM templates WHERE identity = ?1",
                params![identity],
                row_to_record,
            )
            .optional()
            .map_err(backend)
    }

    pub fn list(&self) -> Result<Vec<TemplateRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT identity, template_id, dimension, created_at, updated_at
                 FROM templates ORDER BY identity",
            )
            .map_err(backend)?;
        let rows = stmt.query_map([], row_to_record).map_err(backend)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }
}

impl TemplateStore for SqliteTemplateStore {
    /// Single-statement upsert: the old template stays intact until the new row lands.
    fn save(&mut self, identity: &str, template: &Embedding) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let template_id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO templates (identity, template_id, embedding, dimension, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(identity) DO UPDATE SET
                     template_id = excluded.template_id,
                     embedding   = excluded.embedding,
                     dimension   = excluded.dimension,
                     updated_at  = excluded.updated_at",
                params![
                    identity,
                    template_id,
                    encode(&template.values),
                    template.dim() as i64,
                    now
                ],
            )
            .map_err(backend)?;
        tracing::debug!(identity, template_id = %template_id, "template row written");
        Ok(())
    }

    fn fetch(&self, identity: &str) -> Result<Option<Embedding>, StoreError> {
        let row: Option<(Vec<u8>, i64)> = self
            .conn
            .query_row(
                "SELECT embedding, dimension FROM templates WHERE identity = ?1",
                params![identity],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(backend)?;

        let Some((blob, dimension)) = row else {
            return Ok(None);
        };
        let values = decode(&blob).ok_or_else(|| StoreError::Corrupt {
            identity: identity.to_string(),
            reason: format!("blob length {} is not a multiple of 4", blob.len()),
        })?;
        if values.len() as i64 != dimension {
            return Err(StoreError::Corrupt {
                identity: identity.to_string(),
                reason: format!("{} values, dimension column says {dimension}", values.len()),
            });
        }
        Ok(Some(Embedding::new(values)))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TemplateRecord> {
    Ok(TemplateRecord {
        identity: row.get(0)?,
        template_id: row.get(1)?,
        dimension: row.get::<_, i64>(2)? as usize,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn encode(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
