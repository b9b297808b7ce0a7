//! # Sync Engine
//!
//! Orchestrator of the device-side sync. One engine per logged-in session.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          sync_all()                                     │
//! │                                                                         │
//! │  offline / unconfigured / lock held / already syncing ──► [] (no-op)    │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ 0. first cycle of the session: recover orphaned + failed items   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ 1. PUSH    drain the mutation queue (PushPipeline)               │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ 2. PULL    every registered entity (ConcurrencyScheduler)        │  │
//! │  │            phase 1: parallel-safe, N workers                     │  │
//! │  │            phase 2: everything else, one at a time               │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ 3. SECONDARY  templates → checklists → execution sessions        │  │
//! │  │               → attachments → customer/technician signatures     │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               ▼                                         │
//! │  ok:  state idle + last_sync_at, sync_complete, observers notified     │
//! │  err: state error + message, sync_error                                 │
//! │  lock released on every path                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entity failures are part of a successful cycle: they come back in the
//! per-entity results and in `sync_complete.failed`. Only a failure of the
//! cycle itself (queue recovery, push drain storage errors) ends in
//! `error`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fieldops_core::{
    EntitySyncResult, MutationOperation, MutationQueueItem, SyncPhase, SyncState,
    DEFAULT_PAGE_SIZE,
};
use fieldops_db::Database;

use crate::bulk::{BulkWriter, WriteProgress};
use crate::config::{Session, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::events::{NoOpEmitter, SyncEvent, SyncEventEmitter};
use crate::fast_push::SyncCompletionObserver;
use crate::flight::SingleFlight;
use crate::metrics::{MetricsCollector, SyncTrigger};
use crate::network::{Connectivity, NetworkMonitor};
use crate::pull::PullPipeline;
use crate::push::{PushOutcome, PushPipeline};
use crate::queue::MutationQueue;
use crate::registry::{EntityConfig, EntityRegistry};
use crate::retry::sleep_unless_offline;
use crate::scheduler::ConcurrencyScheduler;
use crate::secondary::{SecondaryContext, SecondarySync};
use crate::transport::{HttpTransport, SyncTransport};

// =============================================================================
// Session
// =============================================================================

/// The configured session and when it began.
#[derive(Debug, Clone)]
struct ActiveSession {
    session: Session,
    started_at: DateTime<Utc>,
}

/// Puts the state back to `error` if a cycle future is dropped mid-flight.
struct CycleGuard<'a> {
    state: &'a RwLock<SyncState>,
    armed: bool,
}

impl CycleGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.state.try_write() {
            Ok(mut state) => state.finish_err("Sync cancelled"),
            Err(_) => warn!("Sync cancelled while state was locked"),
        }
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Offline-first sync orchestrator.
pub struct SyncEngine {
    /// Sync configuration.
    config: SyncConfig,

    /// Local database.
    db: Database,

    /// Server seam.
    transport: Arc<dyn SyncTransport>,

    /// Event emitter for UI notifications.
    emitter: Arc<dyn SyncEventEmitter>,

    connectivity: Connectivity,

    session: RwLock<Option<ActiveSession>>,
    registry: RwLock<EntityRegistry>,
    secondaries: RwLock<Vec<Arc<dyn SecondarySync>>>,
    observers: RwLock<Vec<Arc<dyn SyncCompletionObserver>>>,

    queue: MutationQueue,
    push: PushPipeline,
    pull: PullPipeline,
    scheduler: ConcurrencyScheduler,
    metrics: Arc<MetricsCollector>,

    /// Current sync state.
    state: RwLock<SyncState>,

    /// Serializes full cycles (and targeted pulls).
    sync_flight: SingleFlight,

    /// Coalesces push-only drains.
    push_flight: SingleFlight,

    /// Whether this session's recovery sweep already ran.
    recovered: AtomicBool,
}

impl SyncEngine {
    // -------------------------------------------------------------------------
    // Session
    // -------------------------------------------------------------------------

    /// Sets the session credentials. Calling it again with the same
    /// credentials changes nothing.
    pub async fn configure(
        &self,
        base_url: impl Into<String>,
        token: impl Into<String>,
        principal_id: impl Into<String>,
    ) -> SyncResult<()> {
        let session = Session::new(base_url, token, principal_id);
        session.validate()?;

        let mut slot = self.session.write().await;
        if slot.as_ref().is_some_and(|active| active.session == session) {
            return Ok(());
        }

        info!(principal = %session.principal_id, "Sync engine configured");
        *slot = Some(ActiveSession {
            session,
            started_at: Utc::now(),
        });
        self.recovered.store(false, Ordering::Release);
        Ok(())
    }

    pub async fn is_configured(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Forgets the session credentials. Registrations are kept.
    pub async fn reset_session(&self) {
        *self.session.write().await = None;
        self.recovered.store(false, Ordering::Release);
        debug!("Sync session reset");
    }

    /// Forgets the session and every entity registration.
    pub async fn logout(&self) {
        self.reset_session().await;
        self.registry.write().await.clear();
        *self.state.write().await = SyncState::default();
        info!("Sync engine logged out");
    }

    async fn active_session(&self) -> Option<ActiveSession> {
        self.session.read().await.clone()
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Registers (or replaces) an entity.
    ///
    /// Entities left at the built-in page size use `pull.default_page_size`.
    /// Default-upsert entities get their local table created.
    pub async fn register_entity(&self, mut config: EntityConfig) -> SyncResult<Arc<EntityConfig>> {
        if config.page_size == DEFAULT_PAGE_SIZE {
            config.page_size = self.config.pull.default_page_size;
        }
        config.validate()?;

        if !config.write_strategy.is_custom() {
            self.db.records().ensure_table(&config.table).await?;
        }

        let registered = self.registry.write().await.register(config)?;
        debug!(
            entity = %registered.name,
            concurrency = ?registered.concurrency,
            "Entity registered"
        );
        Ok(registered)
    }

    /// Adds a secondary sub-sync. Sub-syncs run in kind order.
    pub async fn register_secondary(&self, sync: Arc<dyn SecondarySync>) {
        let mut secondaries = self.secondaries.write().await;
        secondaries.push(sync);
        secondaries.sort_by_key(|s| s.kind().position());
    }

    /// Adds an observer told about every successful full sync.
    pub async fn add_completion_observer(&self, observer: Arc<dyn SyncCompletionObserver>) {
        self.observers.write().await.push(observer);
    }

    /// Registered entities in registration order.
    pub async fn entities(&self) -> Vec<Arc<EntityConfig>> {
        self.registry.read().await.entities()
    }

    // -------------------------------------------------------------------------
    // Local Writes
    // -------------------------------------------------------------------------

    /// Queues a local create, update or delete for upload.
    pub async fn enqueue(
        &self,
        entity: &str,
        operation: MutationOperation,
        record: Value,
    ) -> SyncResult<MutationQueueItem> {
        self.registry.read().await.require(entity)?;
        self.queue.enqueue(entity, operation, record).await
    }

    /// Queues a save, inferring create or update from the record's
    /// timestamps.
    pub async fn save(&self, entity: &str, record: Value) -> SyncResult<MutationQueueItem> {
        self.registry.read().await.require(entity)?;
        self.queue.save(entity, record).await
    }

    // -------------------------------------------------------------------------
    // Full Sync
    // -------------------------------------------------------------------------

    /// Runs one full cycle. Returns one result per registered entity, or
    /// nothing when the cycle was skipped.
    pub async fn sync_all(&self) -> SyncResult<Vec<EntitySyncResult>> {
        self.sync_cycle(SyncTrigger::Manual).await
    }

    async fn sync_cycle(&self, trigger: SyncTrigger) -> SyncResult<Vec<EntitySyncResult>> {
        if !self.connectivity.is_online() {
            debug!("Offline, skipping sync");
            return Ok(Vec::new());
        }
        let Some(active) = self.active_session().await else {
            debug!("Not configured, skipping sync");
            return Ok(Vec::new());
        };
        let Some(_flight) = self.sync_flight.try_acquire() else {
            debug!("Sync already in progress");
            return Ok(Vec::new());
        };
        {
            let mut state = self.state.write().await;
            if state.is_syncing() {
                return Ok(Vec::new());
            }
            state.begin();
        }

        let guard = CycleGuard {
            state: &self.state,
            armed: true,
        };
        let result = self.run_cycle(&active, trigger).await;
        guard.disarm();
        result
    }

    async fn run_cycle(
        &self,
        active: &ActiveSession,
        trigger: SyncTrigger,
    ) -> SyncResult<Vec<EntitySyncResult>> {
        let clock = Instant::now();
        let started_at = Utc::now();
        let registry = self.registry.read().await.clone();
        let entities = registry.entities();

        self.metrics.begin_cycle(trigger).await;
        self.emitter.emit(SyncEvent::SyncStart {
            entities: entities.len(),
        });
        info!(entities = entities.len(), "Sync cycle started");

        match self.cycle_body(active, &registry, &entities, started_at).await {
            Ok(results) => {
                let failed = results.iter().filter(|r| !r.success).count();
                let duration_ms = clock.elapsed().as_millis() as u64;

                self.metrics.end_cycle(failed == 0).await;
                self.state.write().await.finish_ok(Utc::now());
                self.emitter.emit(SyncEvent::SyncComplete {
                    entities: results.len(),
                    failed,
                    duration_ms,
                });
                for observer in self.observers.read().await.iter() {
                    observer.full_sync_completed();
                }

                info!(
                    entities = results.len(),
                    failed,
                    duration_ms,
                    "Sync cycle complete"
                );
                Ok(results)
            }
            Err(e) => {
                error!(error = %e, "Sync cycle failed");
                self.metrics.end_cycle(false).await;
                self.state.write().await.finish_err(e.to_string());
                self.emitter.emit(SyncEvent::SyncError {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn cycle_body(
        &self,
        active: &ActiveSession,
        registry: &EntityRegistry,
        entities: &[Arc<EntityConfig>],
        started_at: DateTime<Utc>,
    ) -> SyncResult<Vec<EntitySyncResult>> {
        self.recover_once(active).await?;

        self.set_phase(SyncPhase::Push, 0).await;
        let pushed = self.push.drain(&active.session, registry, started_at).await?;
        self.metrics.record_push(pushed.pushed, pushed.failed).await;

        self.set_phase(SyncPhase::Pull, entities.len()).await;
        let session = &active.session;
        let mut results = self
            .scheduler
            .run(
                entities,
                || self.connectivity.is_online(),
                move |config| async move {
                    self.entity_started(&config.name).await;
                    let result = self.pull.pull_entity(session, &config, started_at).await;
                    self.entity_finished().await;
                    result
                },
            )
            .await;

        for result in &mut results {
            let tally = pushed.tally(&result.entity);
            result.pushed = tally.pushed;
            result.push_failed = tally.failed;
        }

        self.set_phase(SyncPhase::Secondary, entities.len()).await;
        self.run_secondaries(session).await;

        Ok(results)
    }

    /// Session-start recovery, once per session.
    async fn recover_once(&self, active: &ActiveSession) -> SyncResult<()> {
        if self.recovered.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self
            .queue
            .recover(self.config.push.max_attempts, active.started_at)
            .await
        {
            self.recovered.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    async fn run_secondaries(&self, session: &Session) {
        let secondaries = self.secondaries.read().await.clone();
        let ctx = SecondaryContext {
            db: &self.db,
            session,
            connectivity: &self.connectivity,
            emitter: self.emitter.as_ref(),
        };

        for sync in secondaries {
            if !self.connectivity.is_online() {
                debug!(kind = %sync.kind(), "Offline, skipping remaining sub-syncs");
                break;
            }
            match sync.run(&ctx).await {
                Ok(report) => debug!(
                    kind = %sync.kind(),
                    succeeded = report.succeeded,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Sub-sync finished"
                ),
                Err(e) => warn!(kind = %sync.kind(), error = %e, "Sub-sync failed"),
            }
        }
    }

    async fn set_phase(&self, phase: SyncPhase, total: usize) {
        let mut state = self.state.write().await;
        state.progress.phase = phase;
        state.progress.total_entities = total;
        state.progress.current_entity = None;
    }

    async fn entity_started(&self, entity: &str) {
        self.state.write().await.progress.current_entity = Some(entity.to_string());
    }

    async fn entity_finished(&self) {
        self.state.write().await.progress.completed_entities += 1;
    }

    // -------------------------------------------------------------------------
    // Targeted Pull
    // -------------------------------------------------------------------------

    /// Pulls one registered entity outside a full cycle.
    ///
    /// Returns `None` when offline, unconfigured or while a cycle runs.
    pub async fn sync_entity(&self, name: &str) -> SyncResult<Option<EntitySyncResult>> {
        let config = self.registry.read().await.require(name)?;

        if !self.connectivity.is_online() {
            return Ok(None);
        }
        let Some(active) = self.active_session().await else {
            return Ok(None);
        };
        let Some(_flight) = self.sync_flight.try_acquire() else {
            debug!(entity = %name, "Sync in progress, skipping targeted pull");
            return Ok(None);
        };

        self.metrics.begin_cycle(SyncTrigger::Targeted).await;
        let result = self
            .pull
            .pull_entity(&active.session, &config, Utc::now())
            .await;
        self.metrics.end_cycle(result.success).await;
        Ok(Some(result))
    }

    // -------------------------------------------------------------------------
    // Retry
    // -------------------------------------------------------------------------

    /// [`sync_all`](Self::sync_all) with exponential backoff.
    ///
    /// An attempt fails when the cycle errors or any entity fails. A failed
    /// attempt is retried up to `retry.max_retries` times, waiting
    /// `retry.delay_for(retry)` first (1s, 2s, 4s by default); going
    /// offline ends the wait with [`SyncError::RetryCancelled`]. The last
    /// failure is reported at once as `sync_retry_exhausted`.
    pub async fn sync_with_retry(&self) -> SyncResult<Vec<EntitySyncResult>> {
        let max_retries = self.config.retry.max_retries;
        let mut retry = 0;

        let last_error = loop {
            let error = match self.sync_cycle(SyncTrigger::Retry).await {
                Ok(results) if results.iter().all(|r| r.success) => return Ok(results),
                Ok(results) => {
                    let failed: Vec<&str> = results
                        .iter()
                        .filter(|r| !r.success)
                        .map(|r| r.entity.as_str())
                        .collect();
                    format!("Entities failed: {}", failed.join(", "))
                }
                Err(e) => e.to_string(),
            };
            if retry == max_retries {
                break error;
            }
            retry += 1;

            let delay = self.config.retry.delay_for(retry);
            warn!(
                retry,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Sync attempt failed, retrying"
            );
            self.emitter.emit(SyncEvent::SyncRetry {
                retry,
                max_retries,
                delay_ms: delay.as_millis() as u64,
                error,
            });
            sleep_unless_offline(delay, &self.connectivity).await?;
        };

        let attempts = max_retries + 1;
        error!(attempts, error = %last_error, "Sync retries exhausted");
        self.emitter.emit(SyncEvent::SyncRetryExhausted {
            attempts,
            error: last_error.clone(),
        });
        Err(SyncError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    // -------------------------------------------------------------------------
    // Push Only
    // -------------------------------------------------------------------------

    /// Drains the mutation queue without pulling.
    ///
    /// Does nothing while a full cycle runs; concurrent calls coalesce
    /// into the running one.
    pub async fn push_only(&self) -> SyncResult<PushOutcome> {
        if self.sync_flight.is_held() {
            debug!("Full sync in progress, skipping push-only");
            return Ok(PushOutcome::default());
        }
        if !self.connectivity.is_online() {
            return Ok(PushOutcome::default());
        }
        let Some(active) = self.active_session().await else {
            return Ok(PushOutcome::default());
        };
        let Some(_flight) = self.push_flight.try_acquire() else {
            debug!("Push-only already running");
            return Ok(PushOutcome::default());
        };

        self.emitter.emit(SyncEvent::PushOnlyStart);
        let registry = self.registry.read().await.clone();

        match self.push.drain(&active.session, &registry, Utc::now()).await {
            Ok(outcome) => {
                self.emitter.emit(SyncEvent::PushOnlyComplete {
                    pushed: outcome.pushed,
                    failed: outcome.failed,
                });
                Ok(outcome)
            }
            Err(e) => {
                error!(error = %e, "Push-only failed");
                self.emitter.emit(SyncEvent::PushOnlyError {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub async fn state(&self) -> SyncState {
        self.state.read().await.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Unacknowledged mutations.
    pub async fn pending_count(&self) -> SyncResult<i64> {
        self.queue.pending_count().await
    }

    pub fn emit(&self, event: SyncEvent) {
        self.emitter.emit(event);
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The server seam, for collaborators such as
    /// [`TransportChecklistApi`](crate::checklists::TransportChecklistApi).
    pub fn transport(&self) -> Arc<dyn SyncTransport> {
        self.transport.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Starts reacting to connectivity transitions.
    pub fn start_network_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        NetworkMonitor::new(Arc::downgrade(self), &self.connectivity).spawn()
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating a SyncEngine with options.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    db: Option<Database>,
    transport: Option<Arc<dyn SyncTransport>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
    connectivity: Option<Connectivity>,
    progress: Option<mpsc::Sender<WriteProgress>>,
}

impl SyncEngineBuilder {
    /// Creates a new builder with the given config.
    pub fn new(config: SyncConfig) -> Self {
        SyncEngineBuilder {
            config,
            db: None,
            transport: None,
            emitter: None,
            connectivity: None,
            progress: None,
        }
    }

    /// Sets the database.
    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    /// Replaces the default [`HttpTransport`].
    pub fn with_transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the event emitter.
    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Sets the connectivity feed. Defaults to always online.
    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Receives bulk-write progress.
    pub fn with_progress(mut self, progress: mpsc::Sender<WriteProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Builds the engine and spawns its write worker.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> SyncResult<Arc<SyncEngine>> {
        self.config.validate()?;

        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;

        tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Internal(format!("No Tokio runtime: {}", e)))?;

        let transport: Arc<dyn SyncTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(self.config.transport.clone())?),
        };
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));
        let connectivity = self
            .connectivity
            .unwrap_or_else(Connectivity::always_online);

        let metrics = Arc::new(MetricsCollector::new(self.config.metrics.history_limit));
        let writer = BulkWriter::spawn(
            db.clone(),
            self.config.bulk.clone(),
            metrics.clone(),
            self.progress,
        );
        let push = PushPipeline::new(
            &db,
            transport.clone(),
            emitter.clone(),
            self.config.push.clone(),
        );
        let pull = PullPipeline::new(
            db.sync_meta(),
            writer,
            transport.clone(),
            emitter.clone(),
            metrics.clone(),
        );

        Ok(Arc::new(SyncEngine {
            scheduler: ConcurrencyScheduler::new(self.config.engine.parallelism),
            queue: MutationQueue::new(&db),
            config: self.config,
            db,
            transport,
            emitter,
            connectivity,
            session: RwLock::new(None),
            registry: RwLock::new(EntityRegistry::new()),
            secondaries: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
            push,
            pull,
            metrics,
            state: RwLock::new(SyncState::default()),
            sync_flight: SingleFlight::new(),
            push_flight: SingleFlight::new(),
            recovered: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fieldops_core::{entities, MutationStatus, SyncStatus};
    use fieldops_db::DbConfig;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{watch, Mutex};

    use crate::secondary::{SecondaryKind, SecondaryReport};
    use crate::test_support::{FakeServer, RecordingEmitter};

    struct Fixture {
        engine: Arc<SyncEngine>,
        db: Database,
        server: Arc<FakeServer>,
        emitter: Arc<RecordingEmitter>,
    }

    fn test_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.retry.base_delay_ms = 10;
        config
    }

    async fn fixture_with(connectivity: Connectivity) -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let server = Arc::new(FakeServer::new());
        let emitter = Arc::new(RecordingEmitter::default());
        let engine = SyncEngineBuilder::new(test_config())
            .with_database(db.clone())
            .with_transport(server.clone())
            .with_emitter(emitter.clone())
            .with_connectivity(connectivity)
            .build()
            .unwrap();
        Fixture {
            engine,
            db,
            server,
            emitter,
        }
    }

    async fn configured() -> Fixture {
        let f = fixture_with(Connectivity::always_online()).await;
        f.engine
            .configure("https://api.example.com/", "token", "tech-1")
            .await
            .unwrap();
        f
    }

    fn clients(n: usize) -> Vec<Value> {
        (0..n)
            .map(|i| json!({"id": format!("c-{:03}", i), "name": format!("Client {}", i)}))
            .collect()
    }

    #[tokio::test]
    async fn test_paged_pull_scenario() {
        let f = configured().await;
        f.engine
            .register_entity(EntityConfig::new(entities::CLIENTS).page_size(50))
            .await
            .unwrap();
        f.server.seed(entities::CLIENTS, clients(120)).await;

        let results = f.engine.sync_all().await.unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].pulled, 120);
        assert_eq!(f.server.pull_count(entities::CLIENTS).await, 3);
        assert_eq!(f.db.records().count(entities::CLIENTS).await.unwrap(), 120);

        let meta = f.db.sync_meta().get(entities::CLIENTS).await.unwrap().unwrap();
        assert!(meta.last_sync_at.is_some());

        let state = f.engine.state().await;
        assert_eq!(state.status, SyncStatus::Idle);
        assert!(state.last_sync_at.is_some());
        assert_eq!(state.progress.completed_entities, 1);

        let names = f.emitter.names();
        assert_eq!(names.first(), Some(&"sync_start"));
        assert_eq!(names.last(), Some(&"sync_complete"));
    }

    #[tokio::test]
    async fn test_second_sync_pulls_nothing_new() {
        let f = configured().await;
        f.engine
            .register_entity(EntityConfig::new(entities::CLIENTS))
            .await
            .unwrap();
        let stamped: Vec<Value> = (0..5)
            .map(|i| json!({"id": format!("c-{}", i), "name": "A", "updated_at": "2024-01-01T00:00:00Z"}))
            .collect();
        f.server.seed(entities::CLIENTS, stamped).await;

        let first = f.engine.sync_all().await.unwrap();
        let second = f.engine.sync_all().await.unwrap();

        assert_eq!(first[0].pulled, 5);
        assert!(second[0].success);
        assert_eq!(second[0].pulled, 0);
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_single_flight() {
        let f = configured().await;
        f.engine
            .register_entity(EntityConfig::new(entities::CLIENTS))
            .await
            .unwrap();
        f.server.seed(entities::CLIENTS, clients(3)).await;
        f.server.set_pull_delay(Duration::from_millis(200)).await;

        let first = tokio::spawn({
            let engine = f.engine.clone();
            async move { engine.sync_all().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = f.engine.sync_all().await.unwrap();
        assert!(second.is_empty());
        assert!(f.engine.state().await.is_syncing());

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(f.server.pull_count(entities::CLIENTS).await, 1);
    }

    #[tokio::test]
    async fn test_skipped_when_offline_or_unconfigured() {
        let (_tx, rx) = watch::channel(false);
        let offline = fixture_with(Connectivity::new(rx)).await;
        offline
            .engine
            .configure("https://api.example.com/", "token", "tech-1")
            .await
            .unwrap();
        offline
            .engine
            .register_entity(EntityConfig::new(entities::CLIENTS))
            .await
            .unwrap();
        assert!(offline.engine.sync_all().await.unwrap().is_empty());
        assert!(offline.server.pull_requests().await.is_empty());

        let unconfigured = fixture_with(Connectivity::always_online()).await;
        assert!(!unconfigured.engine.is_configured().await);
        assert!(unconfigured.engine.sync_all().await.unwrap().is_empty());
        assert!(unconfigured.emitter.events().is_empty());
    }

    #[tokio::test]
    async fn test_configure_is_idempotent_and_validated() {
        let f = fixture_with(Connectivity::always_online()).await;
        for _ in 0..2 {
            f.engine
                .configure("https://api.example.com/", "token", "tech-1")
                .await
                .unwrap();
        }
        assert!(f.engine.is_configured().await);

        let err = f.engine.configure("ftp://example.com", "t", "p").await.unwrap_err();
        assert!(err.is_config_error());

        f.engine.logout().await;
        assert!(!f.engine.is_configured().await);
        assert!(f.engine.entities().await.is_empty());
    }

    #[tokio::test]
    async fn test_offline_edits_pushed_then_pulled() {
        let f = configured().await;
        f.engine
            .register_entity(EntityConfig::new(entities::CLIENTS))
            .await
            .unwrap();
        for i in 0..3 {
            f.engine
                .enqueue(
                    entities::CLIENTS,
                    MutationOperation::Create,
                    json!({"id": format!("c-{}", i), "name": "Offline"}),
                )
                .await
                .unwrap();
        }
        assert_eq!(f.engine.pending_count().await.unwrap(), 3);

        let results = f.engine.sync_all().await.unwrap();

        let pushes = f.server.push_requests().await;
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].1.mutations.len(), 3);
        assert_eq!(results[0].pushed, 3);
        assert_eq!(f.engine.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_parents_pushed_first_whatever_the_registration_order() {
        let f = configured().await;
        f.engine
            .register_entity(EntityConfig::new(entities::QUOTES))
            .await
            .unwrap();
        f.engine
            .register_entity(EntityConfig::new(entities::CLIENTS))
            .await
            .unwrap();
        f.engine
            .enqueue(entities::QUOTES, MutationOperation::Create, json!({"id": "q-1", "client_id": "c-1"}))
            .await
            .unwrap();
        f.engine
            .enqueue(entities::CLIENTS, MutationOperation::Create, json!({"id": "c-1", "name": "Acme"}))
            .await
            .unwrap();

        f.engine.sync_all().await.unwrap();

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
    async fn test_enqueue_requires_registration() {
        let f = configured().await;
        let err = f
            .engine
            .enqueue(entities::QUOTES, MutationOperation::Create, json!({"id": "q-1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnregisteredEntity(_)));
        assert_eq!(f.engine.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_push_keeps_local_version() {
        let f = configured().await;
        f.engine
            .register_entity(EntityConfig::new(entities::CLIENTS))
            .await
            .unwrap();
        f.server
            .seed(entities::CLIENTS, vec![json!({"id": "c-1", "name": "Server"})])
            .await;
        f.server
            .fail_push(entities::CLIENTS, SyncError::from_status(503, "down"))
            .await;
        f.engine
            .enqueue(entities::CLIENTS, MutationOperation::Update, json!({"id": "c-1", "name": "Local"}))
            .await
            .unwrap();

        let results = f.engine.sync_all().await.unwrap();

        assert!(results[0].success);
        assert_eq!(results[0].push_failed, 1);
        assert!(f.db.records().get(entities::CLIENTS, "c-1").await.unwrap().is_none());
        assert_eq!(f.engine.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_orphaned_items_recovered_on_first_cycle() {
        let f = fixture_with(Connectivity::always_online()).await;
        f.engine
            .register_entity(EntityConfig::new(entities::CLIENTS))
            .await
            .unwrap();
        let item = f
            .engine
            .enqueue(entities::CLIENTS, MutationOperation::Create, json!({"id": "c-1", "name": "A"}))
            .await
            .unwrap();
        // Claimed by a run that never finished.
        f.db.mutation_queue().mark_processing(&[item.id]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        f.engine
            .configure("https://api.example.com/", "token", "tech-1")
            .await
            .unwrap();
        f.engine.sync_all().await.unwrap();

        let item = f.db.mutation_queue().get(item.id).await.unwrap().unwrap();
        assert_eq!(item.status, MutationStatus::Completed);
    }

    #[tokio::test]
    async fn test_parallel_safe_entities_pull_first() {
        let f = configured().await;
        f.engine
            .register_entity(EntityConfig::new(entities::QUOTES).sequential())
            .await
            .unwrap();
        f.engine
            .register_entity(EntityConfig::new(entities::CLIENTS).parallel_safe())
            .await
            .unwrap();
        f.server
            .fail_pull(entities::CLIENTS, SyncError::from_status(500, "boom"))
            .await;

        let results = f.engine.sync_all().await.unwrap();

        let order: Vec<String> = f
            .server
            .pull_requests()
            .await
            .into_iter()
            .map(|(endpoint, _)| endpoint)
            .collect();
        assert_eq!(order, ["sync/clients", "sync/quotes"]);

        // Results follow registration order.
        assert_eq!(results[0].entity, entities::QUOTES);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(f.engine.state().await.status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_retry_backs_off_then_gives_up() {
        let f = configured().await;
        f.engine
            .register_entity(EntityConfig::new(entities::CLIENTS))
            .await
            .unwrap();
        f.server
            .fail_pull(entities::CLIENTS, SyncError::from_status(503, "down"))
            .await;

        let err = f.engine.sync_with_retry().await.unwrap_err();
        assert!(matches!(err, SyncError::RetriesExhausted { attempts: 4, .. }));

        let delays: Vec<u64> = f
            .emitter
            .events()
            .into_iter()
            .filter_map(|event| match event {
                SyncEvent::SyncRetry { delay_ms, .. } => Some(delay_ms),
                _ => None,
            })
            .collect();
        assert_eq!(delays, [10, 20, 40]);
        assert_eq!(f.server.pull_count(entities::CLIENTS).await, 4);

        // The final failure is reported without another wait.
        let names = f.emitter.names();
        let exhausted = names.iter().position(|n| *n == "sync_retry_exhausted").unwrap();
        assert_eq!(exhausted, names.len() - 1);
        assert_eq!(names[exhausted - 1], "sync_complete");
        assert_eq!(f.emitter.count("sync_retry_exhausted"), 1);

        let history = f.engine.metrics().history().await;
        assert!(history.iter().all(|c| c.trigger == SyncTrigger::Retry && !c.success));
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let f = configured().await;
        f.engine
            .register_entity(EntityConfig::new(entities::CLIENTS))
            .await
            .unwrap();
        f.server
            .fail_pull_times(entities::CLIENTS, SyncError::Timeout(30), Some(1))
            .await;

        let results = f.engine.sync_with_retry().await.unwrap();
        assert!(results[0].success);
        assert_eq!(f.emitter.count("sync_retry"), 1);
        assert_eq!(f.emitter.count("sync_retry_exhausted"), 0);
    }

    #[tokio::test]
    async fn test_push_only_skips_pulls() {
        let f = configured().await;
        f.engine
            .register_entity(EntityConfig::new(entities::CLIENTS))
            .await
            .unwrap();
        f.engine
            .enqueue(entities::CLIENTS, MutationOperation::Create, json!({"id": "c-1", "name": "A"}))
            .await
            .unwrap();

        let outcome = f.engine.push_only().await.unwrap();

        assert_eq!(outcome.pushed, 1);
        assert!(f.server.pull_requests().await.is_empty());
        assert_eq!(f.emitter.names(), ["push_only_start", "mutation_pushed", "push_only_complete"]);
    }

    #[tokio::test]
    async fn test_targeted_pull() {
        let f = configured().await;
        f.engine
            .register_entity(EntityConfig::new(entities::CLIENTS))
            .await
            .unwrap();
        f.server.seed(entities::CLIENTS, clients(2)).await;

        let err = f.engine.sync_entity(entities::INVOICES).await.unwrap_err();
        assert!(matches!(err, SyncError::UnregisteredEntity(_)));

        let result = f.engine.sync_entity(entities::CLIENTS).await.unwrap().unwrap();
        assert_eq!(result.pulled, 2);
        assert_eq!(f.engine.state().await.status, SyncStatus::Idle);

        let history = f.engine.metrics().history().await;
        assert_eq!(history[0].trigger, SyncTrigger::Targeted);
    }

    struct RecordingSecondary {
        kind: SecondaryKind,
        log: Arc<Mutex<Vec<SecondaryKind>>>,
        fail: bool,
    }

    #[async_trait]
    impl SecondarySync for RecordingSecondary {
        fn kind(&self) -> SecondaryKind {
            self.kind
        }

        async fn run(&self, _ctx: &SecondaryContext<'_>) -> SyncResult<SecondaryReport> {
            self.log.lock().await.push(self.kind);
            if self.fail {
                return Err(SyncError::from_status(500, "upload failed"));
            }
            Ok(SecondaryReport::default())
        }
    }

    #[tokio::test]
    async fn test_secondaries_run_in_kind_order() {
        let f = configured().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        for (kind, fail) in [
            (SecondaryKind::TechnicianSignatures, false),
            (SecondaryKind::Attachments, true),
            (SecondaryKind::Templates, false),
        ] {
            f.engine
                .register_secondary(Arc::new(RecordingSecondary {
                    kind,
                    log: log.clone(),
                    fail,
                }))
                .await;
        }

        f.engine.sync_all().await.unwrap();

        assert_eq!(
            *log.lock().await,
            [
                SecondaryKind::Templates,
                SecondaryKind::Attachments,
                SecondaryKind::TechnicianSignatures
            ]
        );
        assert_eq!(f.engine.state().await.status, SyncStatus::Idle);
    }

    struct CountingObserver(AtomicUsize);

    impl SyncCompletionObserver for CountingObserver {
        fn full_sync_completed(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_observers_notified_after_success() {
        let f = configured().await;
        let observer = Arc::new(CountingObserver(AtomicUsize::new(0)));
        f.engine.add_completion_observer(observer.clone()).await;

        f.engine.sync_all().await.unwrap();
        f.engine.sync_all().await.unwrap();

        assert_eq!(observer.0.load(Ordering::SeqCst), 2);
        assert_eq!(f.engine.metrics().summary().await.cycles, 2);
    }
}
