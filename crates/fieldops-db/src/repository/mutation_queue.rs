//! # Mutation Queue Repository
//!
//! Durable queue of local writes waiting to be pushed.
//!
//! ## Status Transitions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Mutation Lifecycle                                   │
//! │                                                                         │
//! │  enqueue()                                                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │   pending ──── mark_processing() ────► processing                      │
//! │       ▲        (UPDATE … RETURNING,         │                           │
//! │       │         attempts += 1)              ├── mark_completed() ──► completed
//! │       │                                     │                           │
//! │       │                                     └── mark_failed() ─────► failed
//! │       │                                                              │  │
//! │       └──── reset_failed_to_pending()  (once per session, retryable) ◄─┘  │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • Only ids returned by mark_processing() may be sent                  │
//! │  • Two concurrent drains can never claim the same item                 │
//! │  • pending / processing / failed rows guard their record from pulls    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::error::DbResult;
use fieldops_core::{MutationOperation, MutationQueueItem, MutationStatus};

const SELECT_COLUMNS: &str = "id, entity, entity_id, operation, payload, status, attempts, \
     error, retryable, created_at, updated_at";

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueCounts {
    /// Items the server has not acknowledged yet.
    pub fn unacknowledged(&self) -> i64 {
        self.pending + self.processing + self.failed
    }
}

/// Repository for mutation queue operations.
#[derive(Debug, Clone)]
pub struct MutationQueueRepository {
    pool: SqlitePool,
}

impl MutationQueueRepository {
    /// Creates a new MutationQueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        MutationQueueRepository { pool }
    }

    /// Appends a pending mutation.
    ///
    /// ## Arguments
    /// * `entity` - Entity name, e.g. "clients"
    /// * `entity_id` - Id of the record the mutation applies to
    /// * `operation` - create / update / delete
    /// * `payload` - JSON serialization of the record
    ///
    /// ## Example
    /// ```rust,ignore
    /// let item = repo
    ///     .enqueue("clients", "c-1", MutationOperation::Create, &payload)
    ///     .await?;
    /// assert_eq!(item.status, MutationStatus::Pending);
    /// ```
    pub async fn enqueue(
        &self,
        entity: &str,
        entity_id: &str,
        operation: MutationOperation,
        payload: &str,
    ) -> DbResult<MutationQueueItem> {
        let now = Utc::now();

        debug!(
            entity = %entity,
            entity_id = %entity_id,
            operation = %operation,
            "Queuing mutation"
        );

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO mutation_queue (
                entity, entity_id, operation, payload,
                status, attempts, error, retryable, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, NULL, 1, ?5, ?5)
            RETURNING id
            "#,
        )
        .bind(entity)
        .bind(entity_id)
        .bind(operation)
        .bind(payload)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(MutationQueueItem {
            id,
            entity: entity.to_string(),
            entity_id: entity_id.to_string(),
            operation,
            payload: payload.to_string(),
            status: MutationStatus::Pending,
            attempts: 0,
            error: None,
            retryable: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Gets a single mutation by queue id.
    pub async fn get(&self, id: i64) -> DbResult<Option<MutationQueueItem>> {
        let sql = format!("SELECT {} FROM mutation_queue WHERE id = ?1", SELECT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(map_row).transpose()
    }

    /// Gets mutations that may be pushed now, oldest first.
    ///
    /// ## Returns
    /// - every `pending` item
    /// - `failed` items that are retryable, below `max_attempts`, and failed
    ///   before `cycle_started_at` (an item that failed during this cycle
    ///   waits for the next one)
    pub async fn fetch_pushable(
        &self,
        limit: u32,
        cycle_started_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> DbResult<Vec<MutationQueueItem>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM mutation_queue
            WHERE status = 'pending'
               OR (status = 'failed'
                   AND retryable = 1
                   AND attempts < ?2
                   AND updated_at < ?3)
            ORDER BY id ASC
            LIMIT ?1
            "#,
            SELECT_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(limit)
            .bind(max_attempts)
            .bind(cycle_started_at)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(map_row).collect()
    }

    /// Atomically claims items for sending.
    ///
    /// Moves `pending`/`failed` items to `processing` and bumps their
    /// attempt count in a single statement. Items already claimed by
    /// another drain are left alone.
    ///
    /// ## Returns
    /// The ids that were actually claimed. Only these may be sent.
    pub async fn mark_processing(&self, ids: &[i64]) -> DbResult<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE mutation_queue SET status = 'processing', attempts = attempts + 1, updated_at = ",
        );
        builder.push_bind(Utc::now());
        builder.push(" WHERE status IN ('pending', 'failed') AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") RETURNING id");

        let mut claimed: Vec<i64> = builder
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await?;
        claimed.sort_unstable();

        debug!(requested = ids.len(), claimed = claimed.len(), "Claimed mutations");
        Ok(claimed)
    }

    /// Marks a mutation as acknowledged by the server.
    pub async fn mark_completed(&self, id: i64) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE mutation_queue SET
                status = 'completed',
                error = NULL,
                updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records a push failure.
    ///
    /// ## Arguments
    /// * `id` - Queue id
    /// * `error` - Server or transport message
    /// * `retryable` - false for server rejections; such items are never
    ///   picked up again
    pub async fn mark_failed(&self, id: i64, error: &str, retryable: bool) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE mutation_queue SET
                status = 'failed',
                error = ?2,
                retryable = ?3,
                updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(retryable)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Recovery sweep: returns retryable failures to `pending`.
    ///
    /// Items that already used `max_attempts` stay failed.
    pub async fn reset_failed_to_pending(&self, max_attempts: u32) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE mutation_queue SET
                status = 'pending',
                updated_at = ?2
            WHERE status = 'failed' AND retryable = 1 AND attempts < ?1
            "#,
        )
        .bind(max_attempts)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            info!(count = reset, "Reset failed mutations to pending");
        }
        Ok(reset)
    }

    /// Returns `processing` items claimed before `claimed_before` to `pending`.
    ///
    /// A claim older than the current session belongs to a drain that never
    /// finished (the app was killed mid-push).
    pub async fn recover_orphaned(&self, claimed_before: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE mutation_queue SET
                status = 'pending',
                updated_at = ?2
            WHERE status = 'processing' AND updated_at < ?1
            "#,
        )
        .bind(claimed_before)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(count = recovered, "Recovered orphaned mutations");
        }
        Ok(recovered)
    }

    /// Record ids of `entity` that still have an unacknowledged mutation.
    ///
    /// Used by the pull path to skip server snapshots of those records.
    pub async fn unacknowledged_entity_ids(&self, entity: &str) -> DbResult<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT entity_id
            FROM mutation_queue
            WHERE entity = ?1 AND status IN ('pending', 'processing', 'failed')
            "#,
        )
        .bind(entity)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().collect())
    }

    /// Lists every mutation for one record, oldest first.
    pub async fn list_for_record(
        &self,
        entity: &str,
        entity_id: &str,
    ) -> DbResult<Vec<MutationQueueItem>> {
        let sql = format!(
            "SELECT {} FROM mutation_queue WHERE entity = ?1 AND entity_id = ?2 ORDER BY id ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(entity)
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(map_row).collect()
    }

    /// Counts rows per status.
    pub async fn count_by_status(&self) -> DbResult<QueueCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM mutation_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: MutationStatus = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status {
                MutationStatus::Pending => counts.pending = n,
                MutationStatus::Processing => counts.processing = n,
                MutationStatus::Completed => counts.completed = n,
                MutationStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    /// Number of mutations the server has not acknowledged yet.
    pub async fn pending_count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM mutation_queue WHERE status IN ('pending', 'processing', 'failed')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Deletes completed mutations older than the specified days.
    ///
    /// ## Returns
    /// Number of rows deleted.
    pub async fn cleanup_completed(&self, older_than_days: i64) -> DbResult<u64> {
        let cutoff = Utc::now() - Duration::days(older_than_days);

        let result = sqlx::query(
            "DELETE FROM mutation_queue WHERE status = 'completed' AND updated_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn map_row(row: &SqliteRow) -> DbResult<MutationQueueItem> {
    Ok(MutationQueueItem {
        id: row.try_get("id")?,
        entity: row.try_get("entity")?,
        entity_id: row.try_get("entity_id")?,
        operation: row.try_get("operation")?,
        payload: row.try_get("payload")?,
        status: row.try_get("status")?,
        attempts: row.try_get("attempts")?,
        error: row.try_get("error")?,
        retryable: row.try_get("retryable")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
