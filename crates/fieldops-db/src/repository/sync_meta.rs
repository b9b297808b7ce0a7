//! # Sync Meta Repository
//!
//! One row per entity recording the outcome of its last pull.
//!
//! `last_sync_at` is the `since` filter of the next pull. `last_cursor` is
//! kept for diagnostics only; paging restarts from the first page every
//! cycle.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use fieldops_core::{SyncMeta, SyncMetaStatus};

/// Repository for per-entity sync metadata.
#[derive(Debug, Clone)]
pub struct SyncMetaRepository {
    pool: SqlitePool,
}

impl SyncMetaRepository {
    /// Creates a new SyncMetaRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncMetaRepository { pool }
    }

    /// Gets the meta row of an entity, if it was ever pulled.
    pub async fn get(&self, entity: &str) -> DbResult<Option<SyncMeta>> {
        let row = sqlx::query(
            r#"
            SELECT entity, last_sync_at, last_cursor, status, last_error, records_pulled
            FROM sync_meta
            WHERE entity = ?1
            "#,
        )
        .bind(entity)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_row).transpose()
    }

    /// Inserts or replaces the meta row of `meta.entity`.
    pub async fn upsert(&self, meta: &SyncMeta) -> DbResult<()> {
        debug!(
            entity = %meta.entity,
            status = meta.status.as_str(),
            records_pulled = meta.records_pulled,
            "Saving sync meta"
        );

        sqlx::query(
            r#"
            INSERT INTO sync_meta (
                entity, last_sync_at, last_cursor, status, last_error, records_pulled, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(entity) DO UPDATE SET
                last_sync_at = excluded.last_sync_at,
                last_cursor = excluded.last_cursor,
                status = excluded.status,
                last_error = excluded.last_error,
                records_pulled = excluded.records_pulled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&meta.entity)
        .bind(meta.last_sync_at)
        .bind(&meta.last_cursor)
        .bind(meta.status.as_str())
        .bind(&meta.last_error)
        .bind(meta.records_pulled)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lists all meta rows ordered by entity name.
    pub async fn list(&self) -> DbResult<Vec<SyncMeta>> {
        let rows = sqlx::query(
            r#"
            SELECT entity, last_sync_at, last_cursor, status, last_error, records_pulled
            FROM sync_meta
            ORDER BY entity ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_row).collect()
    }

    /// Forgets an entity's checkpoint so its next pull is a full pull.
    pub async fn clear(&self, entity: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM sync_meta WHERE entity = ?1")
            .bind(entity)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn map_row(row: &SqliteRow) -> DbResult<SyncMeta> {
    let status: String = row.try_get("status")?;
    let status: SyncMetaStatus = status
        .parse()
        .map_err(|e| DbError::corrupt("sync_meta", e))?;

    Ok(SyncMeta {
        entity: row.try_get("entity")?,
        last_sync_at: row.try_get("last_sync_at")?,
        last_cursor: row.try_get("last_cursor")?,
        status,
        last_error: row.try_get("last_error")?,
        records_pulled: row.try_get("records_pulled")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_upsert_then_get() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.sync_meta();

        assert!(repo.get("clients").await.unwrap().is_none());

        let at = Utc::now();
        let mut meta = SyncMeta {
            entity: "clients".into(),
            last_sync_at: Some(at),
            last_cursor: Some("page-3".into()),
            status: SyncMetaStatus::Ok,
            last_error: None,
            records_pulled: 120,
        };
        repo.upsert(&meta).await.unwrap();

        meta.status = SyncMetaStatus::Error;
        meta.last_error = Some("503".into());
        repo.upsert(&meta).await.unwrap();

        let stored = repo.get("clients").await.unwrap().unwrap();
        assert_eq!(stored.status, SyncMetaStatus::Error);
        assert_eq!(stored.last_error.as_deref(), Some("503"));
        assert_eq!(stored.records_pulled, 120);
        assert_eq!(stored.last_sync_at, Some(at));
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.sync_meta();
        repo.upsert(&SyncMeta {
            entity: "quotes".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        repo.clear("quotes").await.unwrap();
        assert!(repo.get("quotes").await.unwrap().is_none());
    }
}
