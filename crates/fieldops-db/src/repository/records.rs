//! # Record Repository
//!
//! Per-entity record tables holding the device's copy of server data.
//!
//! ## Table Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  <table>                                                               │
//! │  ├── id          TEXT NOT NULL PRIMARY KEY                             │
//! │  ├── payload     TEXT NOT NULL CHECK (json_valid(payload))             │
//! │  ├── created_at  TEXT              (as sent by the server)             │
//! │  ├── updated_at  TEXT              (as sent by the server)             │
//! │  └── synced_at   TEXT NOT NULL     (stamped by the bulk writer)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Tables are created when an entity is registered. Every table name passes
//! [`validate_identifier`] before it is interpolated into SQL.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use fieldops_core::validation::validate_identifier;

/// One row of a record table.
///
/// `id` is optional so that a record the server sent without an id reaches
/// the database and is refused there, one row at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRow {
    pub id: Option<String>,
    pub payload: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub synced_at: DateTime<Utc>,
}

/// Repository for per-entity record tables.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    /// Creates a new RecordRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    /// Creates the record table if it does not exist.
    pub async fn ensure_table(&self, table: &str) -> DbResult<()> {
        let table = checked(table)?;

        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                id          TEXT NOT NULL PRIMARY KEY,
                payload     TEXT NOT NULL CHECK (json_valid(payload)),
                created_at  TEXT,
                updated_at  TEXT,
                synced_at   TEXT NOT NULL
            )
            "#
        );
        sqlx::query(&sql).execute(&self.pool).await?;

        debug!(table = %table, "Record table ready");
        Ok(())
    }

    /// Upserts rows in one transaction.
    ///
    /// Either every row is written or none is. The caller decides what to
    /// do with a failed chunk.
    ///
    /// ## Returns
    /// Number of rows written.
    pub async fn upsert_chunk(&self, table: &str, rows: &[LocalRow]) -> DbResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = checked(table)?;

        let sql = format!(
            r#"
            INSERT INTO "{table}" (id, payload, created_at, updated_at, synced_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                synced_at = excluded.synced_at
            "#
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        for row in rows {
            sqlx::query(&sql)
                .bind(&row.id)
                .bind(&row.payload)
                .bind(&row.created_at)
                .bind(&row.updated_at)
                .bind(row.synced_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        Ok(rows.len())
    }

    /// Gets one row by id.
    pub async fn get(&self, table: &str, id: &str) -> DbResult<Option<LocalRow>> {
        let table = checked(table)?;
        let sql = format!(
            r#"SELECT id, payload, created_at, updated_at, synced_at FROM "{table}" WHERE id = ?1"#
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(map_row).transpose()
    }

    /// Lists all ids in the table.
    pub async fn list_ids(&self, table: &str) -> DbResult<Vec<String>> {
        let table = checked(table)?;
        let sql = format!(r#"SELECT id FROM "{table}" ORDER BY id ASC"#);

        let ids: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(ids)
    }

    /// Counts rows in the table.
    pub async fn count(&self, table: &str) -> DbResult<i64> {
        let table = checked(table)?;
        let sql = format!(r#"SELECT COUNT(*) FROM "{table}""#);

        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Deletes one row. Returns whether it existed.
    pub async fn delete(&self, table: &str, id: &str) -> DbResult<bool> {
        let table = checked(table)?;
        let sql = format!(r#"DELETE FROM "{table}" WHERE id = ?1"#);

        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

fn checked(table: &str) -> DbResult<&str> {
    validate_identifier("table", table).map_err(|_| DbError::InvalidIdentifier(table.to_string()))?;
    Ok(table)
}

fn map_row(row: &SqliteRow) -> DbResult<LocalRow> {
    Ok(LocalRow {
        id: row.try_get("id")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        synced_at: row.try_get("synced_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    fn row(id: Option<&str>, payload: &str) -> LocalRow {
        LocalRow {
            id: id.map(str::to_string),
            payload: payload.to_string(),
            created_at: Some("2024-01-01T00:00:00Z".into()),
            updated_at: Some("2024-01-02T00:00:00Z".into()),
            synced_at: Utc::now(),
        }
    }

    async fn repo() -> RecordRepository {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.records();
        repo.ensure_table("clients").await.unwrap();
        repo
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing() {
        let repo = repo().await;
        repo.upsert_chunk("clients", &[row(Some("c-1"), r#"{"name":"A"}"#)])
            .await
            .unwrap();
        repo.upsert_chunk("clients", &[row(Some("c-1"), r#"{"name":"B"}"#)])
            .await
            .unwrap();

        assert_eq!(repo.count("clients").await.unwrap(), 1);
        let stored = repo.get("clients", "c-1").await.unwrap().unwrap();
        assert_eq!(stored.payload, r#"{"name":"B"}"#);
    }

    #[tokio::test]
    async fn test_bad_row_rolls_back_whole_chunk() {
        let repo = repo().await;
        let chunk = vec![
            row(Some("c-1"), "{}"),
            row(None, "{}"),
            row(Some("c-3"), "{}"),
        ];

        let err = repo.upsert_chunk("clients", &chunk).await.unwrap_err();
        assert!(err.is_constraint(), "unexpected error: {err}");
        assert_eq!(repo.count("clients").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_json_is_refused() {
        let repo = repo().await;
        let err = repo
            .upsert_chunk("clients", &[row(Some("c-1"), "not json")])
            .await
            .unwrap_err();
        assert!(err.is_constraint());
    }

    #[tokio::test]
    async fn test_table_name_is_checked() {
        let repo = repo().await;
        let err = repo.ensure_table("clients; DROP TABLE x").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidIdentifier(_)));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let repo = repo().await;
        repo.upsert_chunk("clients", &[row(Some("b"), "{}"), row(Some("a"), "{}")])
            .await
            .unwrap();

        assert_eq!(repo.list_ids("clients").await.unwrap(), vec!["a", "b"]);
        assert!(repo.delete("clients", "a").await.unwrap());
        assert!(!repo.delete("clients", "a").await.unwrap());
    }
}
