//! # fieldops-sync: Offline-First Sync Engine
//!
//! Reconciles a technician's device with the fieldops server. The device
//! works fully disconnected; local edits queue up and are uploaded, and
//! server changes are pulled, whenever connectivity allows.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   SyncEngine (Orchestrator)                      │  │
//! │  │                                                                  │  │
//! │  │  One instance per session. Single-flight full cycles,           │  │
//! │  │  push-only fast path, retry with cancellable backoff            │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ PushPipeline   │  │ Concurrency    │  │ Secondary sub-syncs    │    │
//! │  │                │  │ Scheduler      │  │                        │    │
//! │  │ Drains the     │  │                │  │ Templates, checklists, │    │
//! │  │ mutation queue │  │ PullPipeline   │  │ execution sessions,    │    │
//! │  │ in dependency  │  │ per entity,    │  │ attachments,           │    │
//! │  │ order          │  │ two phases     │  │ signatures             │    │
//! │  └───────┬────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │          │                   ▼                                          │
//! │          │           ┌────────────────┐                                 │
//! │          │           │ BulkWriter +   │  pending-mutation guard,        │
//! │          │           │ WriteWorker    │  chunked upserts, bisection     │
//! │          │           └───────┬────────┘                                 │
//! │          ▼                   ▼                                          │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │          fieldops-db (mutation_queue, sync_meta, records)        │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  AROUND THE ENGINE:                                                    │
//! │  • NetworkMonitor: online → sync_with_retry, offline → cancel backoff  │
//! │  • FastPushService: push-only after a recent full sync                 │
//! │  • MetricsCollector: cycle / entity / chunk telemetry                  │
//! │  • SyncEventEmitter: events for the UI                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Engine
//! - [`engine`] - `SyncEngine` orchestrator and builder
//! - [`config`] - Sync configuration (TOML + environment)
//! - [`error`] - Sync error types
//! - [`events`] - Events and emitters
//!
//! ### Pipelines
//! - [`queue`] - Mutation queue front end and payload validation
//! - [`push`] - Mutation upload
//! - [`pull`] - Delta pull per entity
//! - [`bulk`] - Chunked local writes on a worker task
//! - [`scheduler`] - Bounded two-phase entity scheduling
//! - [`secondary`] / [`checklists`] - Sub-syncs after the entity pulls
//!
//! ### Wire
//! - [`protocol`] - Pull/push envelopes
//! - [`transport`] - `SyncTransport` seam and the HTTP client
//! - [`registry`] - Entity configs and push order
//!
//! ### Triggers
//! - [`network`] - Connectivity and the network monitor
//! - [`fast_push`] - Push-only fast path
//! - [`retry`] - Offline-aware backoff sleeps
//! - [`flight`] - Single-flight flags
//! - [`metrics`] - Sync telemetry
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldops_sync::{EntityConfig, SyncConfig, SyncEngineBuilder};
//! use fieldops_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("fieldops.db")).await?;
//! let engine = SyncEngineBuilder::new(SyncConfig::load_or_default(None))
//!     .with_database(db)
//!     .build()?;
//!
//! engine.configure("https://api.fieldops.app/v1/", token, technician_id).await?;
//! engine.register_entity(EntityConfig::new("clients").parallel_safe()).await?;
//! // quotes already depend on clients
//! engine.register_entity(EntityConfig::new("quotes")).await?;
//! engine
//!     .register_entity(EntityConfig::new("site_visits").depends_on(&["work_orders"]))
//!     .await?;
//! engine.start_network_monitor();
//!
//! let results = engine.sync_all().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Engine
pub mod config;
pub mod engine;
pub mod error;
pub mod events;

// Pipelines
pub mod bulk;
pub mod checklists;
pub mod pull;
pub mod push;
pub mod queue;
pub mod scheduler;
pub mod secondary;

// Wire
pub mod protocol;
pub mod registry;
pub mod transport;

// Triggers
pub mod fast_push;
pub mod flight;
pub mod metrics;
pub mod network;
pub mod retry;

#[cfg(test)]
mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

// Core types
pub use config::{Session, SyncConfig};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{SyncError, SyncResult};
pub use events::{BroadcastEmitter, NoOpEmitter, SyncEvent, SyncEventEmitter};

// Pipelines
pub use bulk::{BulkWriter, WriteOutcome, WriteProgress};
pub use checklists::{ChecklistApi, ChecklistSync, TransportChecklistApi};
pub use push::{PushOutcome, PushTally};
pub use secondary::{SecondaryContext, SecondaryKind, SecondaryReport, SecondarySync};

// Wire
pub use protocol::{PullRequest, PullResponse, PushMutation, PushRequest, PushResponse, PushResult};
pub use registry::{EntityConfig, EntityRegistry, RelationalWriter, WriteStrategy};
pub use transport::{HttpTransport, SyncTransport};

// Triggers
pub use fast_push::{FastPushAction, FastPushService, SyncCompletionObserver};
pub use metrics::{CycleMetrics, MetricsCollector, MetricsSummary, SyncTrigger};
pub use network::{Connectivity, NetworkMonitor};
