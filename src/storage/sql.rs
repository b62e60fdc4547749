// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite storage backend for durable local state.
//!
//! Holds the three persisted collections:
//!
//! ```sql
//! content_items(id, kind, payload, size, priority,
//!               created_at, updated_at, last_accessed, access_count)
//! mutations(seq, kind, payload, content_id, idempotency_key, status,
//!           attempt_count, next_retry_at, last_error, created_at, acked_at)
//! progress_snapshot(xp, level, badges, last_reconciled_at)  -- single row
//! ```
//!
//! WAL journal mode is enabled at connect: the mutation log takes a write
//! per user action and readers (cache index rebuild, pending iteration)
//! must not block those writes.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::time::Duration;
use tracing::info;

use super::traits::{StateStore, StorageError};
use crate::content::{ContentItem, ContentKind};
use crate::mutation::{Mutation, MutationKind, MutationStatus};
use crate::progress::ProgressSnapshot;
use crate::queue::backoff::{retry, BackoffPolicy};

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct SqlStore {
    pool: SqlitePool,
}

impl SqlStore {
    /// Open (or create) a SQLite store at the given path.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let url = format!("sqlite://{}?mode=rwc", path);
        Self::connect(&url).await
    }

    /// Connect with startup-mode retry (fails fast on a bad path).
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        info!(url, "opening sqlite state store");

        let pool = retry("sqlite_connect", &BackoffPolicy::startup(), || async {
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        Ok(store)
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        // NORMAL is durable enough under WAL and halves the fsyncs
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS content_items (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                payload BLOB NOT NULL,
                size INTEGER NOT NULL,
                priority INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS mutations (
                seq INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                content_id TEXT,
                idempotency_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                acked_at INTEGER
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_mutations_status ON mutations(status, seq)",
            r#"
            CREATE TABLE IF NOT EXISTS progress_snapshot (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                xp INTEGER NOT NULL,
                level INTEGER NOT NULL,
                badges TEXT NOT NULL,
                last_reconciled_at INTEGER NOT NULL
            )
            "#,
        ];

        for sql in statements {
            retry("sqlite_init_schema", &BackoffPolicy::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    fn content_from_row(row: &SqliteRow) -> Result<ContentItem, StorageError> {
        let kind_str: String = row.try_get("kind").map_err(backend)?;
        let kind = ContentKind::parse(&kind_str)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown content kind '{kind_str}'")))?;

        Ok(ContentItem::from_parts(
            row.try_get("id").map_err(backend)?,
            kind,
            row.try_get::<Vec<u8>, _>("payload").map_err(backend)?,
            row.try_get::<i64, _>("priority").map_err(backend)? as u8,
            row.try_get("created_at").map_err(backend)?,
            row.try_get("updated_at").map_err(backend)?,
            row.try_get("last_accessed").map_err(backend)?,
            row.try_get::<i64, _>("access_count").map_err(backend)? as u64,
        ))
    }

    fn mutation_from_row(row: &SqliteRow) -> Result<Mutation, StorageError> {
        let kind_str: String = row.try_get("kind").map_err(backend)?;
        let kind = MutationKind::parse(&kind_str)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown mutation kind '{kind_str}'")))?;

        let status_str: String = row.try_get("status").map_err(backend)?;
        let status = MutationStatus::parse(&status_str).ok_or_else(|| {
            StorageError::Corrupt(format!("unknown mutation status '{status_str}'"))
        })?;

        let payload_str: String = row.try_get("payload").map_err(backend)?;
        let payload = serde_json::from_str(&payload_str)
            .map_err(|e| StorageError::Corrupt(format!("mutation payload: {e}")))?;

        Ok(Mutation {
            seq: row.try_get::<i64, _>("seq").map_err(backend)? as u64,
            kind,
            payload,
            content_id: row.try_get("content_id").map_err(backend)?,
            idempotency_key: row.try_get("idempotency_key").map_err(backend)?,
            status,
            attempt_count: row.try_get::<i64, _>("attempt_count").map_err(backend)? as u32,
            next_retry_at: row.try_get("next_retry_at").map_err(backend)?,
            last_error: row.try_get("last_error").map_err(backend)?,
            created_at: row.try_get("created_at").map_err(backend)?,
            acked_at: row.try_get("acked_at").map_err(backend)?,
        })
    }
}

#[async_trait]
impl StateStore for SqlStore {
    async fn put_content(&self, item: &ContentItem) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO content_items
                (id, kind, payload, size, priority, created_at, updated_at, last_accessed, access_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(item.kind.as_str())
        .bind(&item.payload)
        .bind(item.size_bytes() as i64)
        .bind(item.priority as i64)
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(item.last_accessed)
        .bind(item.access_count as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_content(&self, id: &str) -> Result<Option<ContentItem>, StorageError> {
        let row = sqlx::query("SELECT * FROM content_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::content_from_row).transpose()
    }

    async fn delete_content(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM content_items WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_content(&self) -> Result<Vec<ContentItem>, StorageError> {
        let rows = sqlx::query("SELECT * FROM content_items")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::content_from_row).collect()
    }

    async fn touch_content(
        &self,
        id: &str,
        last_accessed: i64,
        access_count: u64,
    ) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE content_items SET last_accessed = ?, access_count = ? WHERE id = ?")
                .bind(last_accessed)
                .bind(access_count as i64)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn clear_content(&self) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM content_items")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn insert_mutation(&self, mutation: &Mutation) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&mutation.payload)
            .map_err(|e| StorageError::Corrupt(format!("mutation payload: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO mutations
                (seq, kind, payload, content_id, idempotency_key, status,
                 attempt_count, next_retry_at, last_error, created_at, acked_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(mutation.seq as i64)
        .bind(mutation.kind.as_str())
        .bind(payload)
        .bind(&mutation.content_id)
        .bind(&mutation.idempotency_key)
        .bind(mutation.status.as_str())
        .bind(mutation.attempt_count as i64)
        .bind(mutation.next_retry_at)
        .bind(&mutation.last_error)
        .bind(mutation.created_at)
        .bind(mutation.acked_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_mutation(&self, seq: u64) -> Result<Option<Mutation>, StorageError> {
        let row = sqlx::query("SELECT * FROM mutations WHERE seq = ?")
            .bind(seq as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::mutation_from_row).transpose()
    }

    async fn update_mutation(&self, mutation: &Mutation) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE mutations
            SET status = ?, attempt_count = ?, next_retry_at = ?, last_error = ?, acked_at = ?
            WHERE seq = ?
            "#,
        )
        .bind(mutation.status.as_str())
        .bind(mutation.attempt_count as i64)
        .bind(mutation.next_retry_at)
        .bind(&mutation.last_error)
        .bind(mutation.acked_at)
        .bind(mutation.seq as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn delete_mutation(&self, seq: u64) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM mutations WHERE seq = ?")
            .bind(seq as i64)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn load_by_status(&self, status: MutationStatus) -> Result<Vec<Mutation>, StorageError> {
        let rows = sqlx::query("SELECT * FROM mutations WHERE status = ? ORDER BY seq ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::mutation_from_row).collect()
    }

    async fn load_unresolved(&self) -> Result<Vec<Mutation>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM mutations WHERE status IN ('pending', 'in-flight') ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(Self::mutation_from_row).collect()
    }

    async fn max_seq(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS max_seq FROM mutations")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.try_get::<i64, _>("max_seq").map_err(backend)? as u64)
    }

    async fn purge_acknowledged_before(&self, cutoff: i64) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "DELETE FROM mutations WHERE status = 'acknowledged' AND acked_at IS NOT NULL AND acked_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn load_snapshot(&self) -> Result<Option<ProgressSnapshot>, StorageError> {
        let row = sqlx::query("SELECT * FROM progress_snapshot WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        let Some(row) = row else { return Ok(None) };

        let badges_str: String = row.try_get("badges").map_err(backend)?;
        let badges = serde_json::from_str(&badges_str)
            .map_err(|e| StorageError::Corrupt(format!("snapshot badges: {e}")))?;

        Ok(Some(ProgressSnapshot {
            xp: row.try_get::<i64, _>("xp").map_err(backend)? as u64,
            level: row.try_get::<i64, _>("level").map_err(backend)? as u32,
            badges,
            last_reconciled_at: row.try_get("last_reconciled_at").map_err(backend)?,
        }))
    }

    async fn store_snapshot(&self, snapshot: &ProgressSnapshot) -> Result<(), StorageError> {
        let badges = serde_json::to_string(&snapshot.badges)
            .map_err(|e| StorageError::Corrupt(format!("snapshot badges: {e}")))?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO progress_snapshot (id, xp, level, badges, last_reconciled_at)
            VALUES (1, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.xp as i64)
        .bind(snapshot.level as i64)
        .bind(badges)
        .bind(snapshot.last_reconciled_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}
