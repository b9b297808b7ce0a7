//! # Checklist Sync
//!
//! Pulls the checklist state of every locally known work order.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  work_orders table ──► ids ── minus ids with unacknowledged edits       │
//! │                                   │                                     │
//! │                                   ▼                                     │
//! │                 bounded pool (checklists.concurrency)                   │
//! │                                   │                                     │
//! │        ┌──────────────────────────┼──────────────────────────┐          │
//! │        ▼                          ▼                          ▼          │
//! │   fetch(wo-1)                fetch(wo-2)                fetch(wo-3)     │
//! │     ✗ retry after delay×1      404 → done, no retry      offline →      │
//! │     ✗ retry after delay×2                                skipped        │
//! │     ✓                                                                   │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   work_order_checklists table, keyed by checklist id                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use fieldops_core::records::timestamp_field;
use fieldops_core::{entities, record_id, MAX_PAGE_SIZE};
use fieldops_db::{Database, LocalRow};

use crate::config::{ChecklistSettings, Session};
use crate::error::{SyncError, SyncResult};
use crate::protocol::PullRequest;
use crate::scheduler::run_bounded;
use crate::secondary::{SecondaryContext, SecondaryKind, SecondaryReport, SecondarySync};
use crate::transport::SyncTransport;

/// Fetches the checklists of one work order.
#[async_trait]
pub trait ChecklistApi: Send + Sync {
    async fn fetch_checklists(&self, session: &Session, work_order_id: &str) -> SyncResult<Vec<Value>>;
}

/// [`ChecklistApi`] over a [`SyncTransport`] pull endpoint.
///
/// The endpoint template's `{id}` is replaced by the work order id.
pub struct TransportChecklistApi {
    transport: Arc<dyn SyncTransport>,
    endpoint_template: String,
}

impl TransportChecklistApi {
    pub const DEFAULT_ENDPOINT: &'static str = "work-orders/{id}/checklists";

    pub fn new(transport: Arc<dyn SyncTransport>) -> Self {
        Self::with_endpoint(transport, Self::DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(transport: Arc<dyn SyncTransport>, template: impl Into<String>) -> Self {
        TransportChecklistApi {
            transport,
            endpoint_template: template.into(),
        }
    }

    fn endpoint(&self, work_order_id: &str) -> String {
        self.endpoint_template.replace("{id}", work_order_id)
    }
}

#[async_trait]
impl ChecklistApi for TransportChecklistApi {
    async fn fetch_checklists(&self, session: &Session, work_order_id: &str) -> SyncResult<Vec<Value>> {
        let request = PullRequest::first_page(MAX_PAGE_SIZE, None);
        let response = self
            .transport
            .pull(session, &self.endpoint(work_order_id), &request)
            .await?;
        Ok(response.items)
    }
}

/// Result of one work order.
#[derive(Debug)]
enum Unit {
    Stored,
    Missing,
    Failed,
    Skipped,
}

/// Checklist [`SecondarySync`].
pub struct ChecklistSync {
    api: Arc<dyn ChecklistApi>,
    settings: ChecklistSettings,
}

impl ChecklistSync {
    pub fn new(api: Arc<dyn ChecklistApi>, settings: ChecklistSettings) -> Self {
        ChecklistSync { api, settings }
    }

    /// Work orders eligible for a checklist pull.
    async fn work_order_ids(&self, db: &Database) -> SyncResult<Vec<String>> {
        let records = db.records();
        records.ensure_table(entities::WORK_ORDERS).await?;

        let protected = db
            .mutation_queue()
            .unacknowledged_entity_ids(entities::WORK_ORDERS)
            .await?;
        let ids = records.list_ids(entities::WORK_ORDERS).await?;

        Ok(ids.into_iter().filter(|id| !protected.contains(id)).collect())
    }

    /// Fetches with linear backoff. `NotFound` ends the retries at once.
    async fn fetch_with_retry(&self, session: &Session, work_order_id: &str) -> SyncResult<Vec<Value>> {
        let max_retries = self.settings.max_retries.max(1);
        let mut attempt = 1;

        loop {
            match self.api.fetch_checklists(session, work_order_id).await {
                Ok(checklists) => return Ok(checklists),
                Err(e @ SyncError::NotFound(_)) => return Err(e),
                Err(e) if attempt >= max_retries => return Err(e),
                Err(e) => {
                    let delay = Duration::from_millis(self.settings.retry_delay_ms * u64::from(attempt));
                    debug!(
                        work_order_id = %work_order_id,
                        attempt,
                        ?delay,
                        error = %e,
                        "Checklist fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn store(
        &self,
        db: &Database,
        work_order_id: &str,
        checklists: Vec<Value>,
        protected: &HashSet<String>,
    ) -> SyncResult<usize> {
        let synced_at = Utc::now();
        let mut rows = Vec::with_capacity(checklists.len());

        for mut checklist in checklists {
            let Some(id) = record_id(&checklist) else {
                warn!(work_order_id = %work_order_id, "Checklist without id ignored");
                continue;
            };
            if protected.contains(&id) {
                continue;
            }
            if let Some(object) = checklist.as_object_mut() {
                object
                    .entry("work_order_id")
                    .or_insert_with(|| Value::String(work_order_id.to_string()));
            }

            rows.push(LocalRow {
                id: Some(id),
                payload: serde_json::to_string(&checklist)?,
                created_at: timestamp_field(&checklist, "created_at", "createdAt"),
                updated_at: timestamp_field(&checklist, "updated_at", "updatedAt"),
                synced_at,
            });
        }

        Ok(db.records().upsert_chunk(entities::CHECKLISTS, &rows).await?)
    }

    async fn pull_one(
        &self,
        ctx: &SecondaryContext<'_>,
        work_order_id: &str,
        protected: &HashSet<String>,
    ) -> Unit {
        let checklists = match self.fetch_with_retry(ctx.session, work_order_id).await {
            Ok(checklists) => checklists,
            Err(SyncError::NotFound(_)) => return Unit::Missing,
            Err(e) => {
                warn!(work_order_id = %work_order_id, error = %e, "Checklist pull failed");
                return Unit::Failed;
            }
        };

        match self.store(ctx.db, work_order_id, checklists, protected).await {
            Ok(_) => Unit::Stored,
            Err(e) => {
                warn!(work_order_id = %work_order_id, error = %e, "Checklist write failed");
                Unit::Failed
            }
        }
    }
}

#[async_trait]
impl SecondarySync for ChecklistSync {
    fn kind(&self) -> SecondaryKind {
        SecondaryKind::Checklists
    }

    async fn run(&self, ctx: &SecondaryContext<'_>) -> SyncResult<SecondaryReport> {
        ctx.db.records().ensure_table(entities::CHECKLISTS).await?;

        let work_orders = self.work_order_ids(ctx.db).await?;
        let protected = ctx
            .db
            .mutation_queue()
            .unacknowledged_entity_ids(entities::CHECKLISTS)
            .await?;
        let protected = &protected;

        info!(
            work_orders = work_orders.len(),
            concurrency = self.settings.concurrency,
            "Pulling checklists"
        );

        let units = run_bounded(
            &work_orders,
            self.settings.concurrency,
            || ctx.connectivity.is_online(),
            |_| Unit::Skipped,
            |work_order_id| {
                let work_order_id = work_order_id.clone();
                async move { self.pull_one(ctx, &work_order_id, protected).await }
            },
        )
        .await;

        let mut report = SecondaryReport::default();
        for unit in units {
            match unit {
                Unit::Stored | Unit::Missing => report.succeeded += 1,
                Unit::Failed => report.failed += 1,
                Unit::Skipped => report.skipped += 1,
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Checklists pulled"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldops_core::MutationOperation;
    use fieldops_db::DbConfig;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    use crate::events::NoOpEmitter;
    use crate::network::Connectivity;

    /// Scripted responses per work order; the last entry repeats.
    #[derive(Default)]
    struct ScriptedApi {
        script: Mutex<HashMap<String, Vec<SyncResult<Vec<Value>>>>>,
        calls: AtomicU32,
    }

    impl ScriptedApi {
        async fn script(&self, id: &str, responses: Vec<SyncResult<Vec<Value>>>) {
            self.script.lock().await.insert(id.to_string(), responses);
        }
    }

    #[async_trait]
    impl ChecklistApi for ScriptedApi {
        async fn fetch_checklists(&self, _session: &Session, work_order_id: &str) -> SyncResult<Vec<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().await;
            let responses = script.entry(work_order_id.to_string()).or_default();
            match responses.len() {
                0 => Ok(Vec::new()),
                1 => match &responses[0] {
                    Ok(v) => Ok(v.clone()),
                    Err(e) => Err(SyncError::Transport(e.to_string())),
                },
                _ => responses.remove(0),
            }
        }
    }

    async fn setup(work_orders: &[&str]) -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let records = db.records();
        records.ensure_table(entities::WORK_ORDERS).await.unwrap();
        let rows: Vec<LocalRow> = work_orders
            .iter()
            .map(|id| LocalRow {
                id: Some(id.to_string()),
                payload: json!({"id": id, "client_id": "c-1"}).to_string(),
                created_at: None,
                updated_at: None,
                synced_at: Utc::now(),
            })
            .collect();
        records.upsert_chunk(entities::WORK_ORDERS, &rows).await.unwrap();
        db
    }

    fn settings() -> ChecklistSettings {
        ChecklistSettings {
            concurrency: 2,
            max_retries: 3,
            retry_delay_ms: 10,
        }
    }

    async fn run(sync: &ChecklistSync, db: &Database, connectivity: &Connectivity) -> SecondaryReport {
        let session = Session::new("https://api.example.com/", "token", "tech-1");
        let ctx = SecondaryContext {
            db,
            session: &session,
            connectivity,
            emitter: &NoOpEmitter,
        };
        sync.run(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_pulls_and_stores_checklists() {
        let db = setup(&["wo-1", "wo-2"]).await;
        let api = Arc::new(ScriptedApi::default());
        api.script("wo-1", vec![Ok(vec![json!({"id": "cl-1", "items": []})])]).await;
        api.script("wo-2", vec![
            Err(SyncError::Timeout(30)),
            Ok(vec![json!({"id": "cl-2"}), json!({"id": "cl-3"})]),
        ])
        .await;

        let sync = ChecklistSync::new(api.clone(), settings());
        let report = run(&sync, &db, &Connectivity::always_online()).await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(db.records().count(entities::CHECKLISTS).await.unwrap(), 3);

        let row = db.records().get(entities::CHECKLISTS, "cl-2").await.unwrap().unwrap();
        assert!(row.payload.contains("wo-2"));
    }

    #[tokio::test]
    async fn test_not_found_short_circuits() {
        let db = setup(&["wo-1"]).await;
        let api = Arc::new(ScriptedApi::default());
        api.script("wo-1", vec![Err(SyncError::NotFound("gone".into())), Ok(vec![])]).await;

        let sync = ChecklistSync::new(api.clone(), settings());
        let report = run(&sync, &db, &Connectivity::always_online()).await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_linear_backoff_until_max_retries() {
        let db = setup(&["wo-1"]).await;
        let api = Arc::new(ScriptedApi::default());
        api.script("wo-1", vec![Err(SyncError::Transport("reset".into()))]).await;

        let sync = ChecklistSync::new(api.clone(), settings());
        let start = std::time::Instant::now();
        let report = run(&sync, &db, &Connectivity::always_online()).await;

        assert_eq!(report.failed, 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        // 10 ms × 1 + 10 ms × 2
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_skips_work_orders_with_local_edits_and_when_offline() {
        let db = setup(&["wo-1", "wo-2"]).await;
        db.mutation_queue()
            .enqueue(entities::WORK_ORDERS, "wo-1", MutationOperation::Update, r#"{"id":"wo-1"}"#)
            .await
            .unwrap();

        let api = Arc::new(ScriptedApi::default());
        let sync = ChecklistSync::new(api.clone(), settings());

        let report = run(&sync, &db, &Connectivity::always_online()).await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let report = run(&sync, &db, &Connectivity::new(rx)).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }
}
