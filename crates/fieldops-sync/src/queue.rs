//! # Mutation Queue
//!
//! Durable log of local edits awaiting upload, on top of
//! [`MutationQueueRepository`].
//!
//! ## Item Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  enqueue ──► pending ──claim──► processing ──applied──► completed       │
//! │                 ▲                    │                                  │
//! │                 │                    └──error──► failed                 │
//! │                 │                                   │                   │
//! │                 └──── recovery sweep (once per session, retryable) ─────┘
//! │                                                                         │
//! │  Retryable failed items are also picked up by the next cycle while      │
//! │  attempts < push.max_attempts. Rejections (4xx) stay failed.            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Records are validated here, at the serialization boundary, and again
//! when they are pushed.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use fieldops_core::{record_id, EntityRecord, MutationOperation, MutationQueueItem};
use fieldops_db::{Database, MutationQueueRepository, QueueCounts};

use crate::error::{SyncError, SyncResult};

/// A record that passed its schema, ready to store or send.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecord {
    pub id: String,
    pub value: Value,
}

/// Validates `record` for `operation` on `entity`.
///
/// Deletes only need an id; creates and updates must satisfy the entity's
/// full schema. The returned value is `record` as given, key spelling
/// included.
pub fn validate_record(
    entity: &str,
    operation: MutationOperation,
    record: Value,
) -> SyncResult<ValidatedRecord> {
    if operation == MutationOperation::Delete {
        let id = record_id(&record).ok_or_else(|| {
            SyncError::InvalidPayload(format!("{} delete requires an id", entity))
        })?;
        return Ok(ValidatedRecord { id, value: record });
    }

    let parsed = EntityRecord::parse(entity, record.clone())
        .map_err(|e| SyncError::InvalidPayload(format!("{}: {}", entity, e)))?;
    Ok(ValidatedRecord {
        id: parsed.id(),
        value: record,
    })
}

/// Validates a stored queue payload before it is sent.
pub fn validate_payload(item: &MutationQueueItem) -> SyncResult<ValidatedRecord> {
    let record: Value = serde_json::from_str(&item.payload)
        .map_err(|e| SyncError::InvalidPayload(format!("{}: {}", item.entity, e)))?;
    validate_record(&item.entity, item.operation, record)
}

/// Mutation queue of one engine.
#[derive(Debug, Clone)]
pub struct MutationQueue {
    repo: MutationQueueRepository,
}

impl MutationQueue {
    pub fn new(db: &Database) -> Self {
        MutationQueue {
            repo: db.mutation_queue(),
        }
    }

    /// Validates and appends a pending mutation.
    ///
    /// The caller is responsible for checking that `entity` is registered.
    pub async fn enqueue(
        &self,
        entity: &str,
        operation: MutationOperation,
        record: Value,
    ) -> SyncResult<MutationQueueItem> {
        let record = validate_record(entity, operation, record)?;
        let item = self
            .repo
            .enqueue(entity, &record.id, operation, &record.value.to_string())
            .await?;

        debug!(
            entity = %entity,
            entity_id = %item.entity_id,
            queue_id = item.id,
            operation = %operation,
            "Mutation enqueued"
        );
        Ok(item)
    }

    /// Enqueues a save whose intent the caller did not state.
    ///
    /// The operation is inferred from the record's timestamps (see
    /// [`MutationOperation::infer_from_timestamps`]). The inference is a
    /// heuristic; callers that know the intent should use
    /// [`enqueue`](Self::enqueue).
    pub async fn save(&self, entity: &str, record: Value) -> SyncResult<MutationQueueItem> {
        let parsed = EntityRecord::parse(entity, record.clone())
            .map_err(|e| SyncError::InvalidPayload(format!("{}: {}", entity, e)))?;
        let created_at = parsed.created_at();
        let updated_at = parsed.updated_at();
        let operation =
            MutationOperation::infer_from_timestamps(created_at.as_deref(), updated_at.as_deref());

        self.enqueue(entity, operation, record).await
    }

    /// Session-start recovery.
    ///
    /// Items left `processing` by a previous run (claimed before
    /// `session_started_at`) and retryable `failed` items go back to
    /// `pending`.
    pub async fn recover(
        &self,
        max_attempts: u32,
        session_started_at: DateTime<Utc>,
    ) -> SyncResult<u64> {
        let orphaned = self.repo.recover_orphaned(session_started_at).await?;
        let reset = self.repo.reset_failed_to_pending(max_attempts).await?;

        if orphaned + reset > 0 {
            info!(orphaned, reset, "Recovered mutations for retry");
        }
        Ok(orphaned + reset)
    }

    /// Unacknowledged mutations (pending + processing + failed).
    pub async fn pending_count(&self) -> SyncResult<i64> {
        Ok(self.repo.pending_count().await?)
    }

    pub async fn counts(&self) -> SyncResult<QueueCounts> {
        Ok(self.repo.count_by_status().await?)
    }

    pub async fn get(&self, id: i64) -> SyncResult<Option<MutationQueueItem>> {
        Ok(self.repo.get(id).await?)
    }

    pub fn repository(&self) -> &MutationQueueRepository {
        &self.repo
    }
}
