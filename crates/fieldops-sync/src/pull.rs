//! # Pull Pipeline
//!
//! Delta pull of one entity.
//!
//! ```text
//! since = sync_meta.last_sync_at          cursor = none (never resumed)
//!   │
//!   ▼
//! GET {pull_endpoint}?limit&since[&cursor] ──► items ──► to_local ──► BulkWriter
//!   ▲                                                                   │
//!   └──── has_more && next_cursor ◄──────────── pulled += written ◄─────┘
//!
//! finally: sync_meta = { last_sync_at: cycle start, last_cursor, status }
//! ```
//!
//! Errors end the entity, never the cycle: they come back as a failed
//! [`EntitySyncResult`].

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use fieldops_core::{EntitySyncResult, SyncMeta, SyncMetaStatus};
use fieldops_db::SyncMetaRepository;

use crate::bulk::BulkWriter;
use crate::config::Session;
use crate::error::SyncResult;
use crate::events::{SyncEvent, SyncEventEmitter};
use crate::metrics::MetricsCollector;
use crate::protocol::PullRequest;
use crate::registry::EntityConfig;
use crate::transport::SyncTransport;

/// Running totals of one entity pull, kept across an error.
#[derive(Debug, Default)]
struct PageTally {
    pages: usize,
    pulled: usize,
    cursor: Option<String>,
}

/// Pulls entities page by page into local storage.
#[derive(Clone)]
pub struct PullPipeline {
    meta: SyncMetaRepository,
    writer: BulkWriter,
    transport: Arc<dyn SyncTransport>,
    emitter: Arc<dyn SyncEventEmitter>,
    metrics: Arc<MetricsCollector>,
}

impl PullPipeline {
    pub fn new(
        meta: SyncMetaRepository,
        writer: BulkWriter,
        transport: Arc<dyn SyncTransport>,
        emitter: Arc<dyn SyncEventEmitter>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        PullPipeline {
            meta,
            writer,
            transport,
            emitter,
            metrics,
        }
    }

    /// Pulls every page of `config`'s entity changed since its last pull.
    ///
    /// `cycle_started_at` becomes the entity's next `since`.
    pub async fn pull_entity(
        &self,
        session: &Session,
        config: &EntityConfig,
        cycle_started_at: DateTime<Utc>,
    ) -> EntitySyncResult {
        let start = Instant::now();
        self.emitter.emit(SyncEvent::EntitySyncStart {
            entity: config.name.clone(),
        });

        let mut tally = PageTally::default();
        let outcome = match self.meta.get(&config.name).await {
            Ok(meta) => {
                let since = meta.and_then(|m| m.last_sync_at);
                self.fetch_pages(session, config, since, &mut tally).await
            }
            Err(e) => Err(e.into()),
        };

        let mut result = match &outcome {
            Ok(()) => EntitySyncResult::succeeded(&config.name),
            Err(e) => {
                warn!(entity = %config.name, error = %e, "Entity pull failed");
                EntitySyncResult::failed(&config.name, e.to_string())
            }
        };
        result.pulled = tally.pulled;
        result.pages = tally.pages;
        result.duration_ms = start.elapsed().as_millis() as u64;

        let meta = SyncMeta {
            entity: config.name.clone(),
            last_sync_at: Some(cycle_started_at),
            last_cursor: tally.cursor,
            status: if result.success {
                SyncMetaStatus::Ok
            } else {
                SyncMetaStatus::Error
            },
            last_error: result.error.clone(),
            records_pulled: tally.pulled as i64,
        };
        if let Err(e) = self.meta.upsert(&meta).await {
            warn!(entity = %config.name, error = %e, "Failed to persist sync checkpoint");
        }

        self.metrics.record_entity(&result).await;
        self.emitter.emit(SyncEvent::EntitySyncComplete {
            entity: config.name.clone(),
            success: result.success,
            pulled: result.pulled,
            error: result.error.clone(),
        });

        if result.success {
            info!(
                entity = %config.name,
                pulled = result.pulled,
                pages = result.pages,
                duration_ms = result.duration_ms,
                "Entity pulled"
            );
        }
        result
    }

    async fn fetch_pages(
        &self,
        session: &Session,
        config: &EntityConfig,
        since: Option<DateTime<Utc>>,
        tally: &mut PageTally,
    ) -> SyncResult<()> {
        let mut request = PullRequest::first_page(config.page_size, since);

        loop {
            let page = self
                .transport
                .pull(session, &config.pull_endpoint, &request)
                .await?;
            tally.pages += 1;
            self.metrics.record_page(&config.name, page.items.len()).await;

            debug!(
                entity = %config.name,
                page = tally.pages,
                items = page.items.len(),
                has_more = page.has_more,
                "Pulled page"
            );

            if !page.items.is_empty() {
                let records = page
                    .items
                    .into_iter()
                    .map(|record| config.apply_to_local(record))
                    .collect();
                let written = self.writer.write(config, records).await?;
                tally.pulled += written.written;
            }

            tally.cursor = page.next_cursor;
            if !page.has_more {
                return Ok(());
            }
            match &tally.cursor {
                Some(cursor) => request = request.next_page(cursor.clone()),
                None => {
                    warn!(
                        entity = %config.name,
                        "Server reported more pages without a cursor, stopping"
                    );
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fieldops_core::entities;
    use fieldops_db::{Database, DbConfig};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::BulkSettings;
    use crate::error::SyncError;
    use crate::protocol::{PullResponse, PushRequest, PushResponse};
    use crate::test_support::{FakeServer, RecordingEmitter};

    struct Fixture {
        db: Database,
        server: Arc<FakeServer>,
        emitter: Arc<RecordingEmitter>,
        metrics: Arc<MetricsCollector>,
    }

    impl Fixture {
        async fn new() -> Self {
            let db = Database::new(DbConfig::in_memory()).await.unwrap();
            db.records().ensure_table(entities::CLIENTS).await.unwrap();
            Fixture {
                db,
                server: Arc::new(FakeServer::new()),
                emitter: Arc::new(RecordingEmitter::default()),
                metrics: Arc::new(MetricsCollector::new(10)),
            }
        }

        fn pipeline_with(&self, transport: Arc<dyn SyncTransport>) -> PullPipeline {
            let writer = BulkWriter::spawn(
                self.db.clone(),
                BulkSettings {
                    chunk_size: 25,
                    min_chunk_size: 1,
                },
                self.metrics.clone(),
                None,
            );
            PullPipeline::new(
                self.db.sync_meta(),
                writer,
                transport,
                self.emitter.clone(),
                self.metrics.clone(),
            )
        }

        fn pipeline(&self) -> PullPipeline {
            self.pipeline_with(self.server.clone())
        }
    }

    fn session() -> Session {
        Session::new("https://api.example.com/", "token", "tech-1")
    }

    fn clients(n: usize) -> Vec<Value> {
        (0..n)
            .map(|i| json!({"id": format!("c-{:03}", i), "name": format!("Client {}", i)}))
            .collect()
    }

    #[tokio::test]
    async fn test_pages_until_exhausted() {
        let f = Fixture::new().await;
        f.server.seed(entities::CLIENTS, clients(120)).await;
        let config = EntityConfig::new(entities::CLIENTS).page_size(50);
        let started = Utc::now();

        let result = f.pipeline().pull_entity(&session(), &config, started).await;

        assert!(result.success);
        assert_eq!(result.pulled, 120);
        assert_eq!(result.pages, 3);
        assert_eq!(f.db.records().count(entities::CLIENTS).await.unwrap(), 120);

        let cursors: Vec<Option<String>> = f
            .server
            .pull_requests()
            .await
            .into_iter()
            .map(|(_, request)| request.cursor)
            .collect();
        assert_eq!(cursors, [None, Some("50".to_string()), Some("100".to_string())]);

        let meta = f.db.sync_meta().get(entities::CLIENTS).await.unwrap().unwrap();
        assert_eq!(meta.status, SyncMetaStatus::Ok);
        assert_eq!(meta.records_pulled, 120);
        assert_eq!(meta.last_sync_at, Some(started));

        assert_eq!(f.emitter.names(), ["entity_sync_start", "entity_sync_complete"]);
    }

    #[tokio::test]
    async fn test_next_pull_is_filtered_by_previous_start() {
        let f = Fixture::new().await;
        f.server.seed(entities::CLIENTS, clients(3)).await;
        let config = EntityConfig::new(entities::CLIENTS);
        let pipeline = f.pipeline();

        let first = Utc::now();
        pipeline.pull_entity(&session(), &config, first).await;
        pipeline.pull_entity(&session(), &config, Utc::now()).await;

        let requests = f.server.pull_requests().await;
        assert_eq!(requests[0].1.since, None);
        assert_eq!(requests[1].1.since, Some(first));
        assert_eq!(requests[1].1.cursor, None);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_raised() {
        let f = Fixture::new().await;
        f.server
            .fail_pull(entities::CLIENTS, SyncError::from_status(503, "maintenance"))
            .await;
        let config = EntityConfig::new(entities::CLIENTS);

        let result = f.pipeline().pull_entity(&session(), &config, Utc::now()).await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or_default().contains("maintenance"));

        let meta = f.db.sync_meta().get(entities::CLIENTS).await.unwrap().unwrap();
        assert_eq!(meta.status, SyncMetaStatus::Error);
        assert!(meta.last_error.is_some());

        match f.emitter.events().last() {
            Some(SyncEvent::EntitySyncComplete { success, .. }) => assert!(!success),
            other => panic!("unexpected last event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transform_applied_before_write() {
        let f = Fixture::new().await;
        f.server
            .seed(entities::CLIENTS, vec![json!({"id": "c-1", "displayName": "Ada"})])
            .await;
        let config = EntityConfig::new(entities::CLIENTS).to_local(|mut record| {
            if let Some(name) = record.get("displayName").cloned() {
                record["name"] = name;
            }
            record
        });

        f.pipeline().pull_entity(&session(), &config, Utc::now()).await;

        let row = f.db.records().get(entities::CLIENTS, "c-1").await.unwrap().unwrap();
        let stored: Value = serde_json::from_str(&row.payload).unwrap();
        assert_eq!(stored["name"], "Ada");
    }

    /// Always claims more pages but never hands out a cursor.
    struct CursorlessServer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SyncTransport for CursorlessServer {
        async fn pull(&self, _: &Session, _: &str, _: &PullRequest) -> SyncResult<PullResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PullResponse {
                items: vec![json!({"id": "c-1", "name": "A"})],
                next_cursor: None,
                has_more: true,
                total: None,
            })
        }

        async fn push(&self, _: &Session, _: &str, _: &PushRequest) -> SyncResult<PushResponse> {
            Ok(PushResponse::default())
        }
    }

    #[tokio::test]
    async fn test_more_pages_without_cursor_stops() {
        let f = Fixture::new().await;
        let server = Arc::new(CursorlessServer {
            calls: AtomicUsize::new(0),
        });
        let config = EntityConfig::new(entities::CLIENTS);

        let result = f
            .pipeline_with(server.clone())
            .pull_entity(&session(), &config, Utc::now())
            .await;

        assert!(result.success);
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }
}
