//! # Bulk Writer
//!
//! Writes pulled records into local storage without ever clobbering a
//! record the user edited offline.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  records ──► pending-mutation guard ──► strategy?                       │
//! │              (drop ids with pending/      │                             │
//! │               processing/failed items)    ├── CustomRelational          │
//! │                                           │     └── writer.write(...)   │
//! │                                           │                             │
//! │                                           └── DefaultUpsert             │
//! │                                                 │  (mpsc)               │
//! │                                                 ▼                       │
//! │                                           ┌──────────────┐              │
//! │                                           │ WriteWorker  │              │
//! │                                           │ chunk → tx   │              │
//! │                                           │ yield        │              │
//! │                                           └──────┬───────┘              │
//! │                                                  │ (oneshot)            │
//! │                                                  ▼                      │
//! │                                            WriteOutcome                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Bisection
//! A chunk whose transaction fails on a constraint is halved and each half
//! retried. Once a failing part is no larger than `bulk.min_chunk_size` its
//! records are skipped and logged. Any other database error aborts the
//! write.
//!
//! ```text
//!   [r0 .. r7] ✗ ─► [r0 .. r3] ✓
//!                   [r4 .. r7] ✗ ─► [r4 r5] ✓
//!                                   [r6 r7] ✗ ─► [r6] ✓
//!                                                [r7] ✗  skipped
//! ```

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use fieldops_core::records::timestamp_field;
use fieldops_core::record_id;
use fieldops_db::{Database, LocalRow, RecordRepository};

use crate::config::BulkSettings;
use crate::error::{SyncError, SyncResult};
use crate::metrics::{ChunkMetrics, MetricsCollector};
use crate::registry::{EntityConfig, WriteStrategy};

/// Capacity of the job channel feeding the worker.
const JOB_CHANNEL_CAPACITY: usize = 16;

/// Totals of one bulk write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Rows stored.
    pub written: usize,
    /// Records dropped by bisection.
    pub skipped: usize,
    /// Records dropped by the pending-mutation guard.
    pub guarded: usize,
    pub chunks: usize,
    pub bisections: usize,
}

/// Progress report sent after every chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteProgress {
    pub entity: String,
    pub processed: usize,
    pub total: usize,
    pub written: usize,
    pub skipped: usize,
}

// =============================================================================
// Write Worker
// =============================================================================

struct WriteJob {
    entity: String,
    table: String,
    rows: Vec<LocalRow>,
    reply: oneshot::Sender<SyncResult<WriteOutcome>>,
}

/// Dedicated task that commits chunked upserts.
pub struct WriteWorker {
    records: RecordRepository,
    settings: BulkSettings,
    metrics: Arc<MetricsCollector>,
    progress: Option<mpsc::Sender<WriteProgress>>,
    jobs_rx: mpsc::Receiver<WriteJob>,
}

/// Handle for submitting jobs to a [`WriteWorker`].
///
/// The worker stops once every handle is dropped.
#[derive(Clone)]
pub struct WriteWorkerHandle {
    jobs_tx: mpsc::Sender<WriteJob>,
}

impl WriteWorkerHandle {
    async fn submit(&self, entity: &str, table: &str, rows: Vec<LocalRow>) -> SyncResult<WriteOutcome> {
        let (reply, rx) = oneshot::channel();
        let job = WriteJob {
            entity: entity.to_string(),
            table: table.to_string(),
            rows,
            reply,
        };

        self.jobs_tx
            .send(job)
            .await
            .map_err(|_| SyncError::ChannelError("Write worker stopped".into()))?;
        rx.await?
    }
}

impl WriteWorker {
    /// Creates a worker and its handle.
    pub fn new(
        db: &Database,
        settings: BulkSettings,
        metrics: Arc<MetricsCollector>,
        progress: Option<mpsc::Sender<WriteProgress>>,
    ) -> (Self, WriteWorkerHandle) {
        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_CHANNEL_CAPACITY);

        let worker = WriteWorker {
            records: db.records(),
            settings,
            metrics,
            progress,
            jobs_rx,
        };

        (worker, WriteWorkerHandle { jobs_tx })
    }

    /// Runs the job loop.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        debug!("Write worker starting");

        while let Some(job) = self.jobs_rx.recv().await {
            let result = self.write_rows(&job.entity, &job.table, &job.rows).await;
            // The requester may have gone away; the rows are committed anyway.
            let _ = job.reply.send(result);
        }

        debug!("Write worker stopped");
    }

    async fn write_rows(
        &self,
        entity: &str,
        table: &str,
        rows: &[LocalRow],
    ) -> SyncResult<WriteOutcome> {
        let chunk_size = self.settings.chunk_size.max(1);
        let total = rows.len();
        let mut outcome = WriteOutcome::default();
        let mut processed = 0;

        for chunk in rows.chunks(chunk_size) {
            let started = Instant::now();
            let mut metrics = self.write_chunk(entity, table, chunk).await?;
            metrics.duration_ms = started.elapsed().as_millis() as u64;

            outcome.chunks += 1;
            outcome.written += metrics.written;
            outcome.skipped += metrics.skipped;
            outcome.bisections += metrics.bisections;
            processed += chunk.len();

            debug!(
                entity = %entity,
                size = metrics.size,
                written = metrics.written,
                skipped = metrics.skipped,
                "Chunk committed"
            );
            self.metrics.record_chunk(entity, metrics).await;
            self.report(WriteProgress {
                entity: entity.to_string(),
                processed,
                total,
                written: outcome.written,
                skipped: outcome.skipped,
            });

            tokio::task::yield_now().await;
        }

        Ok(outcome)
    }

    /// Commits one chunk, bisecting on constraint failures.
    async fn write_chunk(
        &self,
        entity: &str,
        table: &str,
        chunk: &[LocalRow],
    ) -> SyncResult<ChunkMetrics> {
        let min_size = self.settings.min_chunk_size.max(1);
        let mut metrics = ChunkMetrics {
            size: chunk.len(),
            ..Default::default()
        };

        // Depth-first, left half first, so rows keep their order.
        let mut parts = vec![chunk];
        while let Some(part) = parts.pop() {
            match self.records.upsert_chunk(table, part).await {
                Ok(written) => metrics.written += written,
                Err(e) if !e.is_constraint() => {
                    return Err(SyncError::LocalWrite {
                        entity: entity.to_string(),
                        message: e.to_string(),
                    });
                }
                Err(e) if part.len() <= min_size => {
                    let ids: Vec<&str> = part.iter().filter_map(|r| r.id.as_deref()).collect();
                    warn!(
                        entity = %entity,
                        count = part.len(),
                        ids = ?ids,
                        error = %e,
                        "Skipping records that cannot be stored"
                    );
                    metrics.skipped += part.len();
                }
                Err(e) => {
                    debug!(entity = %entity, size = part.len(), error = %e, "Bisecting chunk");
                    metrics.bisections += 1;
                    let (left, right) = part.split_at(part.len() / 2);
                    parts.push(right);
                    parts.push(left);
                }
            }
        }

        Ok(metrics)
    }

    fn report(&self, progress: WriteProgress) {
        if let Some(tx) = &self.progress {
            if tx.try_send(progress).is_err() {
                debug!("Progress receiver full or closed, dropping report");
            }
        }
    }
}

// =============================================================================
// Bulk Writer
// =============================================================================

/// Front end of the write path: guard, strategy dispatch, row building.
#[derive(Clone)]
pub struct BulkWriter {
    db: Database,
    worker: WriteWorkerHandle,
}

impl BulkWriter {
    pub fn new(db: Database, worker: WriteWorkerHandle) -> Self {
        BulkWriter { db, worker }
    }

    /// Spawns a [`WriteWorker`] on the current runtime and returns its writer.
    pub fn spawn(
        db: Database,
        settings: BulkSettings,
        metrics: Arc<MetricsCollector>,
        progress: Option<mpsc::Sender<WriteProgress>>,
    ) -> Self {
        let (worker, handle) = WriteWorker::new(&db, settings, metrics, progress);
        tokio::spawn(worker.run());
        BulkWriter::new(db, handle)
    }

    /// Writes pulled records of `config`'s entity.
    pub async fn write(&self, config: &EntityConfig, records: Vec<Value>) -> SyncResult<WriteOutcome> {
        if records.is_empty() {
            return Ok(WriteOutcome::default());
        }

        let protected = self
            .db
            .mutation_queue()
            .unacknowledged_entity_ids(&config.name)
            .await?;

        let incoming = records.len();
        let records: Vec<Value> = records
            .into_iter()
            .filter(|record| match record_id(record) {
                Some(id) => !protected.contains(&id),
                None => true,
            })
            .collect();
        let guarded = incoming - records.len();

        if guarded > 0 {
            info!(
                entity = %config.name,
                guarded,
                "Kept local versions of records with unacknowledged edits"
            );
        }

        let mut outcome = match &config.write_strategy {
            WriteStrategy::CustomRelational(writer) => {
                let written = if records.is_empty() {
                    0
                } else {
                    writer.write(&self.db, records).await?
                };
                WriteOutcome {
                    written,
                    ..Default::default()
                }
            }
            WriteStrategy::DefaultUpsert => {
                let rows = to_rows(&records)?;
                if rows.is_empty() {
                    WriteOutcome::default()
                } else {
                    self.worker.submit(&config.name, &config.table, rows).await?
                }
            }
        };

        outcome.guarded = guarded;
        Ok(outcome)
    }
}

/// Builds table rows, stamping every row with the same sync time.
fn to_rows(records: &[Value]) -> SyncResult<Vec<LocalRow>> {
    let synced_at = Utc::now();
    records
        .iter()
        .map(|record| {
            Ok(LocalRow {
                id: record_id(record),
                payload: serde_json::to_string(record)?,
                created_at: timestamp_field(record, "created_at", "createdAt"),
                updated_at: timestamp_field(record, "updated_at", "updatedAt"),
                synced_at,
            })
        })
        .collect()
}
