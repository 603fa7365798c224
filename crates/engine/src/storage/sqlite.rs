use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use cosync_common::time::epoch_millis;
use cosync_replica::VectorClock;

use super::{AuditDelta, StorageAdapter, StoredDocument};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    document_id TEXT PRIMARY KEY,
    state       TEXT NOT NULL,
    updated_at  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS vector_clocks (
    document_id TEXT NOT NULL,
    client_id   TEXT NOT NULL,
    counter     INTEGER NOT NULL,
    PRIMARY KEY (document_id, client_id)
);
CREATE TABLE IF NOT EXISTS deltas (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id TEXT NOT NULL,
    client_id   TEXT NOT NULL,
    operation   TEXT NOT NULL,
    field_path  TEXT NOT NULL,
    value       TEXT,
    clock_value INTEGER NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_deltas_document ON deltas (document_id, seq);
"#;

/// SQLite-backed storage adapter. Snapshots plus an append-only audit trail
/// of accepted writes; restart recovery reads the snapshot and clock back.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if necessary) the database at `path` and ensure the
    /// schema exists.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("opening sqlite database at {path}"))?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!(path, "storage: sqlite ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    async fn get_document(&self, document_id: &str) -> Result<Option<StoredDocument>> {
        let row = sqlx::query("SELECT state, updated_at FROM documents WHERE document_id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.try_get("state")?;
        let updated_at: i64 = row.try_get("updated_at")?;
        let fields: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&state).context("decoding stored document state")?;
        Ok(Some(StoredDocument {
            fields,
            updated_at: updated_at as u64,
        }))
    }

    async fn save_document(
        &self,
        document_id: &str,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let state = serde_json::to_string(fields)?;
        sqlx::query(
            "INSERT INTO documents (document_id, state, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (document_id) DO UPDATE SET state = excluded.state,
                                                     updated_at = excluded.updated_at",
        )
        .bind(document_id)
        .bind(state)
        .bind(epoch_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_vector_clock(&self, document_id: &str) -> Result<VectorClock> {
        let rows = sqlx::query("SELECT client_id, counter FROM vector_clocks WHERE document_id = ?")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;

        let mut clock = VectorClock::new();
        for row in rows {
            let client_id: String = row.try_get("client_id")?;
            let counter: i64 = row.try_get("counter")?;
            clock.observe(&client_id, counter as u64);
        }
        Ok(clock)
    }

    async fn update_vector_clock(
        &self,
        document_id: &str,
        client_id: &str,
        counter: u64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO vector_clocks (document_id, client_id, counter) VALUES (?, ?, ?)
             ON CONFLICT (document_id, client_id)
             DO UPDATE SET counter = MAX(counter, excluded.counter)",
        )
        .bind(document_id)
        .bind(client_id)
        .bind(counter as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_delta(&self, delta: &AuditDelta) -> Result<()> {
        let value = delta
            .value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO deltas (document_id, client_id, operation, field_path, value,
                                 clock_value, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&delta.document_id)
        .bind(&delta.client_id)
        .bind(delta.operation.as_str())
        .bind(&delta.field_path)
        .bind(value)
        .bind(delta.clock_value as i64)
        .bind(epoch_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
