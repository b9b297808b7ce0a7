//! # Push Pipeline
//!
//! Drains the mutation queue to the server.
//!
//! ## Drain Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  loop:                                                                  │
//! │    fetch ≤ batch_size pushable items ── none? ──► done                  │
//! │        │                                                                │
//! │        ▼                                                                │
//! │    group by entity, order groups by dependencies                        │
//! │    (clients before quotes, unknown entities last)                       │
//! │        │                                                                │
//! │        ▼  for each group                                                │
//! │    claim (pending|failed → processing) ── only claimed items are sent   │
//! │        │                                                                │
//! │        ├── unregistered / invalid payload ──► failed, not retryable     │
//! │        │                                                                │
//! │        ▼                                                                │
//! │    POST {push_endpoint} { mutations: [...] }                            │
//! │        │                                                                │
//! │        ├── Ok: per item, by mutationId                                  │
//! │        │     applied ──► completed                                      │
//! │        │     other   ──► failed (server error), not retryable           │
//! │        │     missing ──► failed, retryable                              │
//! │        │                                                                │
//! │        └── Err: every item failed with the error;                       │
//! │                 retryable unless a 4xx rejection                        │
//! │                                                                         │
//! │    nothing newly claimed in this batch? ──► done                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Items failed during a drain are not refetched by the same drain, so the
//! loop always ends. Items enqueued mid-drain are picked up by a later
//! batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use fieldops_core::{sort_by_dependency_order, MutationQueueItem};
use fieldops_db::{Database, MutationQueueRepository};

use crate::config::{PushSettings, Session};
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, SyncEventEmitter};
use crate::protocol::{PushMutation, PushRequest};
use crate::queue::validate_payload;
use crate::registry::{EntityConfig, EntityRegistry};
use crate::transport::SyncTransport;

/// Failure message when the server omits an item from its results.
const NO_RESULT: &str = "No result returned for mutation";

/// Acknowledged and failed counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushTally {
    pub pushed: usize,
    pub failed: usize,
}

/// Totals of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub pushed: usize,
    pub failed: usize,
    pub batches: usize,
    pub by_entity: HashMap<String, PushTally>,
}

impl PushOutcome {
    fn record(&mut self, entity: &str, tally: PushTally) {
        self.pushed += tally.pushed;
        self.failed += tally.failed;
        let entry = self.by_entity.entry(entity.to_string()).or_default();
        entry.pushed += tally.pushed;
        entry.failed += tally.failed;
    }

    pub fn tally(&self, entity: &str) -> PushTally {
        self.by_entity.get(entity).copied().unwrap_or_default()
    }
}

/// Uploads queued mutations.
pub struct PushPipeline {
    queue: MutationQueueRepository,
    transport: Arc<dyn SyncTransport>,
    emitter: Arc<dyn SyncEventEmitter>,
    settings: PushSettings,
}

impl PushPipeline {
    pub fn new(
        db: &Database,
        transport: Arc<dyn SyncTransport>,
        emitter: Arc<dyn SyncEventEmitter>,
        settings: PushSettings,
    ) -> Self {
        PushPipeline {
            queue: db.mutation_queue(),
            transport,
            emitter,
            settings,
        }
    }

    /// Drains every pushable mutation.
    ///
    /// `cycle_started_at` separates failures of earlier cycles (retried
    /// now) from failures of this drain (left for the next cycle).
    pub async fn drain(
        &self,
        session: &Session,
        registry: &EntityRegistry,
        cycle_started_at: DateTime<Utc>,
    ) -> SyncResult<PushOutcome> {
        let mut outcome = PushOutcome::default();

        loop {
            let items = self
                .queue
                .fetch_pushable(
                    self.settings.batch_size,
                    cycle_started_at,
                    self.settings.max_attempts,
                )
                .await?;
            if items.is_empty() {
                break;
            }

            outcome.batches += 1;
            let claimed = self.push_batch(session, registry, items, &mut outcome).await?;
            if claimed == 0 {
                debug!("Nothing claimable left in batch, stopping drain");
                break;
            }
        }

        if outcome.batches > 0 {
            info!(
                pushed = outcome.pushed,
                failed = outcome.failed,
                batches = outcome.batches,
                "Mutation queue drained"
            );
        }
        Ok(outcome)
    }

    /// Pushes one fetched batch. Returns how many items were claimed.
    async fn push_batch(
        &self,
        session: &Session,
        registry: &EntityRegistry,
        items: Vec<MutationQueueItem>,
        outcome: &mut PushOutcome,
    ) -> SyncResult<usize> {
        let mut groups: Vec<(String, Vec<MutationQueueItem>)> = Vec::new();
        for item in items {
            match groups.iter_mut().find(|(entity, _)| *entity == item.entity) {
                Some((_, group)) => group.push(item),
                None => groups.push((item.entity.clone(), vec![item])),
            }
        }
        sort_by_dependency_order(&mut groups, registry.push_order());

        let mut claimed_total = 0;
        for (entity, items) in groups {
            let ids: Vec<i64> = items.iter().map(|item| item.id).collect();
            let claimed: HashSet<i64> = self.queue.mark_processing(&ids).await?.into_iter().collect();
            if claimed.is_empty() {
                continue;
            }
            claimed_total += claimed.len();

            let items: Vec<MutationQueueItem> = items
                .into_iter()
                .filter(|item| claimed.contains(&item.id))
                .collect();

            let tally = match registry.get(&entity) {
                Some(config) => self.push_group(session, &config, items).await?,
                None => {
                    let err = SyncError::UnregisteredEntity(entity.clone());
                    warn!(entity = %entity, count = items.len(), "Mutations for unregistered entity");
                    self.fail_all(&items, &err.to_string(), false).await?
                }
            };
            outcome.record(&entity, tally);
        }

        Ok(claimed_total)
    }

    /// Sends the claimed items of one entity.
    async fn push_group(
        &self,
        session: &Session,
        config: &EntityConfig,
        items: Vec<MutationQueueItem>,
    ) -> SyncResult<PushTally> {
        let mut tally = PushTally::default();
        let mut sendable = Vec::with_capacity(items.len());
        let mut mutations = Vec::with_capacity(items.len());

        for item in items {
            match validate_payload(&item) {
                Ok(record) => {
                    let record = config.apply_to_server(record.value);
                    mutations.push(PushMutation::from_item(&item, record));
                    sendable.push(item);
                }
                Err(e) => {
                    warn!(
                        entity = %item.entity,
                        entity_id = %item.entity_id,
                        error = %e,
                        "Invalid queued payload"
                    );
                    self.fail(&item, &e.to_string(), false).await?;
                    tally.failed += 1;
                }
            }
        }
        if sendable.is_empty() {
            return Ok(tally);
        }

        debug!(entity = %config.name, count = mutations.len(), "Pushing mutations");
        let request = PushRequest { mutations };

        match self
            .transport
            .push(session, &config.push_endpoint, &request)
            .await
        {
            Ok(response) => {
                let results = response.by_mutation_id();
                for (item, mutation) in sendable.iter().zip(&request.mutations) {
                    match results.get(mutation.mutation_id.as_str()) {
                        Some(result) if result.is_applied() => {
                            self.queue.mark_completed(item.id).await?;
                            self.emitter.emit(SyncEvent::MutationPushed {
                                entity: item.entity.clone(),
                                entity_id: item.entity_id.clone(),
                                mutation_id: mutation.mutation_id.clone(),
                            });
                            tally.pushed += 1;
                        }
                        Some(result) => {
                            let message = result.error.clone().unwrap_or_else(|| {
                                format!("Server returned status '{}'", result.status)
                            });
                            self.fail(item, &message, false).await?;
                            tally.failed += 1;
                        }
                        None => {
                            self.fail(item, NO_RESULT, true).await?;
                            tally.failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                error!(
                    entity = %config.name,
                    count = sendable.len(),
                    error = %e,
                    "Push request failed"
                );
                let failed = self.fail_all(&sendable, &e.to_string(), e.is_retryable()).await?;
                tally.failed += failed.failed;
            }
        }

        Ok(tally)
    }

    async fn fail_all(
        &self,
        items: &[MutationQueueItem],
        error: &str,
        retryable: bool,
    ) -> SyncResult<PushTally> {
        for item in items {
            self.fail(item, error, retryable).await?;
        }
        Ok(PushTally {
            pushed: 0,
            failed: items.len(),
        })
    }

    async fn fail(&self, item: &MutationQueueItem, error: &str, retryable: bool) -> SyncResult<()> {
        self.queue.mark_failed(item.id, error, retryable).await?;
        self.emitter.emit(SyncEvent::MutationFailed {
            entity: item.entity.clone(),
            entity_id: item.entity_id.clone(),
            mutation_id: item.mutation_id(),
            error: error.to_string(),
            retryable,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldops_core::{entities, MutationOperation, MutationStatus};
    use fieldops_db::DbConfig;
    use serde_json::json;

    use crate::protocol::PushResult;
    use crate::queue::MutationQueue;
    use crate::test_support::{FakeServer, RecordingEmitter};

    struct Fixture {
        db: Database,
        server: Arc<FakeServer>,
        emitter: Arc<RecordingEmitter>,
        pipeline: PushPipeline,
        registry: EntityRegistry,
    }

    async fn fixture(batch_size: u32) -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let server = Arc::new(FakeServer::new());
        let emitter = Arc::new(RecordingEmitter::default());
        let settings = PushSettings {
            batch_size,
            max_attempts: 5,
        };
        let pipeline = PushPipeline::new(&db, server.clone(), emitter.clone(), settings);

        let mut registry = EntityRegistry::new();
        registry.register(EntityConfig::new(entities::CLIENTS)).unwrap();
        registry
            .register(EntityConfig::new(entities::QUOTES).depends_on(&[entities::CLIENTS]))
            .unwrap();

        Fixture {
            db,
            server,
            emitter,
            pipeline,
            registry,
        }
    }

    fn session() -> Session {
        Session::new("https://api.example.com/", "token", "tech-1")
    }

    async fn enqueue(db: &Database, entity: &str, id: &str, payload: serde_json::Value) -> MutationQueueItem {
        db.mutation_queue()
            .enqueue(entity, id, MutationOperation::Create, &payload.to_string())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_offline_edits_pushed_in_one_batch() {
        let f = fixture(100).await;
        for i in 1..=3 {
            enqueue(&f.db, entities::CLIENTS, &format!("c-{}", i), json!({"id": format!("c-{}", i), "name": "A"})).await;
        }

        let outcome = f.pipeline.drain(&session(), &f.registry, Utc::now()).await.unwrap();
        assert_eq!(outcome.pushed, 3);
        assert_eq!(outcome.failed, 0);

        let requests = f.server.push_requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1.mutations.len(), 3);

        let counts = f.db.mutation_queue().count_by_status().await.unwrap();
        assert_eq!(counts.completed, 3);
        assert_eq!(counts.unacknowledged(), 0);
        assert_eq!(f.emitter.names(), vec!["mutation_pushed"; 3]);
    }

    #[tokio::test]
    async fn test_dependency_order_between_groups() {
        let f = fixture(100).await;
        enqueue(&f.db, entities::QUOTES, "q-1", json!({"id": "q-1", "client_id": "c-1"})).await;
        enqueue(&f.db, entities::CLIENTS, "c-1", json!({"id": "c-1", "name": "A"})).await;

        f.pipeline.drain(&session(), &f.registry, Utc::now()).await.unwrap();

        let endpoints: Vec<String> = f
            .server
            .push_requests()
            .await
            .into_iter()
            .map(|(endpoint, _)| endpoint)
            .collect();
        assert_eq!(endpoints, ["sync/clients/push", "sync/quotes/push"]);
    }

    #[tokio::test]
    async fn test_mutation_ids_are_unique_per_queue_item() {
        let f = fixture(100).await;
        let a = enqueue(&f.db, entities::CLIENTS, "c-1", json!({"id": "c-1", "name": "A"})).await;
        let b = enqueue(&f.db, entities::CLIENTS, "c-1", json!({"id": "c-1", "name": "B"})).await;

        f.pipeline.drain(&session(), &f.registry, Utc::now()).await.unwrap();

        let requests = f.server.push_requests().await;
        let ids: Vec<&str> = requests[0]
            .1
            .mutations
            .iter()
            .map(|m| m.mutation_id.as_str())
            .collect();
        assert_eq!(ids, [format!("c-1-create-{}", a.id), format!("c-1-create-{}", b.id)]);
    }

    #[tokio::test]
    async fn test_server_verdicts() {
        let f = fixture(100).await;
        let ok = enqueue(&f.db, entities::CLIENTS, "c-1", json!({"id": "c-1", "name": "A"})).await;
        let rejected = enqueue(&f.db, entities::CLIENTS, "c-2", json!({"id": "c-2", "name": "B"})).await;
        let missing = enqueue(&f.db, entities::CLIENTS, "c-3", json!({"id": "c-3", "name": "C"})).await;

        f.server
            .respond_push_with(vec![
                PushResult::applied(ok.mutation_id()),
                PushResult::rejected(rejected.mutation_id(), "duplicate email"),
            ])
            .await;

        let outcome = f.pipeline.drain(&session(), &f.registry, Utc::now()).await.unwrap();
        assert_eq!(outcome.tally(entities::CLIENTS), PushTally { pushed: 1, failed: 2 });

        let queue = f.db.mutation_queue();
        let rejected = queue.get(rejected.id).await.unwrap().unwrap();
        assert_eq!(rejected.status, MutationStatus::Failed);
        assert_eq!(rejected.error.as_deref(), Some("duplicate email"));
        assert!(!rejected.retryable);

        let missing = queue.get(missing.id).await.unwrap().unwrap();
        assert_eq!(missing.error.as_deref(), Some(NO_RESULT));
        assert!(missing.retryable);
    }

    #[tokio::test]
    async fn test_transport_errors_fail_the_group() {
        let f = fixture(100).await;
        let a = enqueue(&f.db, entities::CLIENTS, "c-1", json!({"id": "c-1", "name": "A"})).await;
        let q = enqueue(&f.db, entities::QUOTES, "q-1", json!({"id": "q-1", "client_id": "c-1"})).await;

        f.server.fail_push(entities::CLIENTS, SyncError::from_status(503, "down")).await;
        f.server.fail_push(entities::QUOTES, SyncError::from_status(422, "bad quote")).await;

        let outcome = f.pipeline.drain(&session(), &f.registry, Utc::now()).await.unwrap();
        assert_eq!(outcome.failed, 2);

        let queue = f.db.mutation_queue();
        assert!(queue.get(a.id).await.unwrap().unwrap().retryable);
        assert!(!queue.get(q.id).await.unwrap().unwrap().retryable);

        // Failed in this cycle: not refetched by a second drain of the same cycle.
        let cycle_start = Utc::now() - chrono::Duration::hours(1);
        let again = f.pipeline.drain(&session(), &f.registry, cycle_start).await.unwrap();
        assert_eq!(again.batches, 0);
    }

    #[tokio::test]
    async fn test_unregistered_and_invalid_items_fail_terminally() {
        let f = fixture(100).await;
        let orphan = enqueue(&f.db, "widgets", "w-1", json!({"id": "w-1"})).await;
        let invalid = enqueue(&f.db, entities::CLIENTS, "c-1", json!({"id": "c-1"})).await;

        let outcome = f.pipeline.drain(&session(), &f.registry, Utc::now()).await.unwrap();
        assert_eq!(outcome.failed, 2);
        assert!(f.server.push_requests().await.is_empty());

        let queue = f.db.mutation_queue();
        for id in [orphan.id, invalid.id] {
            let item = queue.get(id).await.unwrap().unwrap();
            assert_eq!(item.status, MutationStatus::Failed);
            assert!(!item.retryable);
        }
    }

    #[tokio::test]
    async fn test_retry_sends_original_edit_time() {
        let f = fixture(100).await;
        let item = enqueue(&f.db, entities::CLIENTS, "c-1", json!({"id": "c-1", "name": "A"})).await;
        let edited_at = f.db.mutation_queue().get(item.id).await.unwrap().unwrap().created_at;

        f.server.fail_push(entities::CLIENTS, SyncError::from_status(503, "down")).await;
        f.pipeline.drain(&session(), &f.registry, Utc::now()).await.unwrap();
        let failed = f.db.mutation_queue().get(item.id).await.unwrap().unwrap();
        assert_eq!(failed.status, MutationStatus::Failed);
        assert!(failed.updated_at > edited_at);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        f.server.clear_failures().await;
        let outcome = f.pipeline.drain(&session(), &f.registry, Utc::now()).await.unwrap();
        assert_eq!(outcome.pushed, 1);

        let sent: Vec<_> = f
            .server
            .push_requests()
            .await
            .into_iter()
            .map(|(_, request)| request.mutations[0].client_updated_at)
            .collect();
        assert_eq!(sent, [edited_at, edited_at]);
    }

    #[tokio::test]
    async fn test_pushed_record_matches_what_was_queued() {
        let f = fixture(100).await;
        let record = json!({"id": "q-1", "clientId": "c-1", "totalCents": 12500});
        MutationQueue::new(&f.db)
            .enqueue(entities::QUOTES, MutationOperation::Create, record.clone())
            .await
            .unwrap();

        f.pipeline.drain(&session(), &f.registry, Utc::now()).await.unwrap();

        let requests = f.server.push_requests().await;
        assert_eq!(requests[0].1.mutations[0].record, record);
    }

    #[tokio::test]
    async fn test_drain_spans_batches() {
        let f = fixture(2).await;
        for i in 0..5 {
            enqueue(&f.db, entities::CLIENTS, &format!("c-{}", i), json!({"id": format!("c-{}", i), "name": "A"})).await;
        }

        let outcome = f.pipeline.drain(&session(), &f.registry, Utc::now()).await.unwrap();
        assert_eq!(outcome.pushed, 5);
        assert_eq!(outcome.batches, 3);
        assert_eq!(f.server.push_requests().await.len(), 3);
    }
}
