//! # Domain Types
//!
//! Core domain types shared by the queue, the pipelines and the orchestrator.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌───────────────────┐   ┌─────────────────┐   ┌─────────────────┐     │
//! │  │ MutationQueueItem │   │    SyncMeta     │   │   SyncState     │     │
//! │  │ ───────────────── │   │  ─────────────  │   │  ─────────────  │     │
//! │  │ id (local seq)    │   │  entity         │   │  status         │     │
//! │  │ entity/entity_id  │   │  last_sync_at   │   │  last_sync_at   │     │
//! │  │ operation         │   │  last_cursor    │   │  error          │     │
//! │  │ status/attempts   │   │  status         │   │  progress       │     │
//! │  └───────────────────┘   └─────────────────┘   └─────────────────┘     │
//! │                                                                         │
//! │  ┌───────────────────┐   ┌─────────────────┐   ┌─────────────────┐     │
//! │  │ MutationOperation │   │ MutationStatus  │   │EntitySyncResult │     │
//! │  │  Create           │   │  Pending        │   │  pulled/pushed  │     │
//! │  │  Update           │   │  Processing     │   │  success/error  │     │
//! │  │  Delete           │   │  Completed      │   └─────────────────┘     │
//! │  └───────────────────┘   │  Failed         │                           │
//! │                          └─────────────────┘                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// =============================================================================
// Mutation Operation
// =============================================================================

/// The kind of local change a queued mutation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum MutationOperation {
    /// Record created on this device.
    Create,
    /// Existing record edited on this device.
    Update,
    /// Record deleted on this device.
    Delete,
}

impl MutationOperation {
    /// Returns the wire / storage name of the operation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MutationOperation::Create => "create",
            MutationOperation::Update => "update",
            MutationOperation::Delete => "delete",
        }
    }

    /// Infers create vs update from a record's timestamps.
    ///
    /// A record whose `created_at` equals its `updated_at` is treated as newly
    /// created. This is a heuristic: a record created and edited within the
    /// same timestamp tick reads as a create, and a caller that sets
    /// `updated_at` on creation reads as an update. Callers that know their
    /// intent should pass the operation explicitly.
    pub fn infer_from_timestamps(created_at: Option<&str>, updated_at: Option<&str>) -> Self {
        match (created_at, updated_at) {
            (Some(created), Some(updated)) if created == updated => MutationOperation::Create,
            (Some(_), None) => MutationOperation::Create,
            _ => MutationOperation::Update,
        }
    }
}

impl std::fmt::Display for MutationOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MutationOperation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" | "insert" => Ok(MutationOperation::Create),
            "update" | "upsert" => Ok(MutationOperation::Update),
            "delete" => Ok(MutationOperation::Delete),
            other => Err(CoreError::UnknownVariant {
                kind: "mutation operation",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Mutation Status
// =============================================================================

/// Lifecycle of a queued mutation.
///
/// ```text
/// pending ──► processing ──► completed
///    ▲             │
///    │             ▼
///    └──────── failed   (recovery sweep / next cycle)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    /// Waiting to be pushed.
    Pending,
    /// Claimed by a push pipeline, request in flight.
    Processing,
    /// Acknowledged by the server.
    Completed,
    /// Push failed; see `error` and `retryable`.
    Failed,
}

impl MutationStatus {
    /// Statuses that still carry an unacknowledged local edit.
    ///
    /// Records with a mutation in one of these statuses must never be
    /// overwritten by a pulled snapshot.
    pub const UNACKNOWLEDGED: [MutationStatus; 3] = [
        MutationStatus::Pending,
        MutationStatus::Processing,
        MutationStatus::Failed,
    ];

    /// Returns the storage name of the status.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Processing => "processing",
            MutationStatus::Completed => "completed",
            MutationStatus::Failed => "failed",
        }
    }

    /// Returns true if the local edit has not been acknowledged by the server.
    pub fn is_unacknowledged(&self) -> bool {
        !matches!(self, MutationStatus::Completed)
    }
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MutationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "processing" => Ok(MutationStatus::Processing),
            "completed" => Ok(MutationStatus::Completed),
            "failed" => Ok(MutationStatus::Failed),
            other => Err(CoreError::UnknownVariant {
                kind: "mutation status",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Mutation Queue Item
// =============================================================================

/// One local create/update/delete waiting to be uploaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationQueueItem {
    /// Local queue id (monotonic, assigned by the store).
    pub id: i64,
    /// Entity name, e.g. "clients".
    pub entity: String,
    /// Id of the record the mutation applies to.
    pub entity_id: String,
    pub operation: MutationOperation,
    /// Serialized record (JSON).
    pub payload: String,
    pub status: MutationStatus,
    /// Number of push attempts so far.
    pub attempts: i64,
    /// Last error message if the push failed.
    pub error: Option<String>,
    /// Whether a failure may be retried on a later cycle.
    pub retryable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MutationQueueItem {
    /// Returns the collision-free id sent to the server for this mutation.
    pub fn mutation_id(&self) -> String {
        compose_mutation_id(&self.entity_id, self.operation, self.id)
    }
}

/// Builds `entityId-operation-localQueueId`.
///
/// Including the operation and the local queue id keeps a create and a later
/// delete of the same record apart in the server's idempotency cache.
pub fn compose_mutation_id(entity_id: &str, operation: MutationOperation, queue_id: i64) -> String {
    format!("{}-{}-{}", entity_id, operation.as_str(), queue_id)
}

// =============================================================================
// Sync Meta
// =============================================================================

/// Outcome of the most recent pull for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMetaStatus {
    /// Never pulled.
    #[default]
    Idle,
    /// Last pull finished without error.
    Ok,
    /// Last pull stopped on an error.
    Error,
}

impl SyncMetaStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncMetaStatus::Idle => "idle",
            SyncMetaStatus::Ok => "ok",
            SyncMetaStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for SyncMetaStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SyncMetaStatus::Idle),
            "ok" => Ok(SyncMetaStatus::Ok),
            "error" => Ok(SyncMetaStatus::Error),
            other => Err(CoreError::UnknownVariant {
                kind: "sync meta status",
                value: other.to_string(),
            }),
        }
    }
}

/// Per-entity pull checkpoint.
///
/// `last_sync_at` is the `since` filter of the next cycle. `last_cursor` is
/// recorded for diagnostics only: paging always restarts from the first page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncMeta {
    pub entity: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_cursor: Option<String>,
    pub status: SyncMetaStatus,
    pub last_error: Option<String>,
    /// Records written during the last pull.
    pub records_pulled: i64,
}

// =============================================================================
// Sync State
// =============================================================================

/// Engine-wide sync status.
///
/// ```text
/// idle ──start──► syncing ──ok──► idle
///                    │
///                    └──error──► error ──next call──► syncing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
}

/// Which stage of a cycle is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Push,
    Pull,
    Secondary,
}

/// Progress of the running cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub completed_entities: usize,
    pub total_entities: usize,
    pub current_entity: Option<String>,
}

/// Snapshot of the engine's sync state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub progress: SyncProgress,
}

impl SyncState {
    /// Enters `syncing`, clearing the previous error.
    pub fn begin(&mut self) {
        self.status = SyncStatus::Syncing;
        self.error = None;
        self.progress = SyncProgress::default();
    }

    /// Leaves `syncing` after a successful cycle.
    pub fn finish_ok(&mut self, at: DateTime<Utc>) {
        self.status = SyncStatus::Idle;
        self.last_sync_at = Some(at);
        self.progress.phase = SyncPhase::Idle;
        self.progress.current_entity = None;
    }

    /// Leaves `syncing` after a failed cycle.
    pub fn finish_err(&mut self, message: impl Into<String>) {
        self.status = SyncStatus::Error;
        self.error = Some(message.into());
        self.progress.phase = SyncPhase::Idle;
        self.progress.current_entity = None;
    }

    pub fn is_syncing(&self) -> bool {
        self.status == SyncStatus::Syncing
    }
}

// =============================================================================
// Entity Sync Result
// =============================================================================

/// Outcome of one entity within a cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntitySyncResult {
    pub entity: String,
    pub success: bool,
    /// Records written locally by the pull.
    pub pulled: usize,
    /// Pages requested by the pull.
    pub pages: usize,
    /// Mutations acknowledged by the server this cycle.
    pub pushed: usize,
    /// Mutations marked failed this cycle.
    pub push_failed: usize,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl EntitySyncResult {
    pub fn succeeded(entity: impl Into<String>) -> Self {
        EntitySyncResult {
            entity: entity.into(),
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(entity: impl Into<String>, error: impl Into<String>) -> Self {
        EntitySyncResult {
            entity: entity.into(),
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

// =============================================================================
// Concurrency Class
// =============================================================================

/// How an entity's pull may be scheduled relative to its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyClass {
    /// May run alongside other parallel-safe pulls.
    ParallelSafe,
    /// Must run alone, after all parallel-safe pulls resolve.
    Sequential,
    /// No declaration; scheduled like `Sequential`.
    #[default]
    Unclassified,
}

impl ConcurrencyClass {
    pub fn is_parallel_safe(&self) -> bool {
        matches!(self, ConcurrencyClass::ParallelSafe)
    }
}
