//! # Sync Events
//!
//! Everything the engine reports to the UI and to observability.
//!
//! ## Event Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  sync_all ──► sync_start                                                │
//! │                 ├── mutation_pushed / mutation_failed   (per item)      │
//! │                 ├── entity_sync_start / entity_sync_complete            │
//! │                 └── sync_complete | sync_error                          │
//! │                                                                         │
//! │  sync_with_retry ──► sync_retry (before each retry)                     │
//! │                      sync_retry_exhausted (after the last one)          │
//! │                                                                         │
//! │  push_only ──► push_only_start ──► push_only_complete | push_only_error │
//! │                                                                         │
//! │  NetworkMonitor ──► online_detected | offline_detected                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine never presents errors itself. Emitters must not block: they
//! are called from inside the sync cycle.

use serde::Serialize;
use tokio::sync::broadcast;

/// One notification from the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStart {
        entities: usize,
    },
    SyncComplete {
        entities: usize,
        failed: usize,
        duration_ms: u64,
    },
    SyncError {
        message: String,
    },
    EntitySyncStart {
        entity: String,
    },
    EntitySyncComplete {
        entity: String,
        success: bool,
        pulled: usize,
        error: Option<String>,
    },
    SyncRetry {
        retry: u32,
        max_retries: u32,
        delay_ms: u64,
        error: String,
    },
    SyncRetryExhausted {
        attempts: u32,
        error: String,
    },
    MutationPushed {
        entity: String,
        entity_id: String,
        mutation_id: String,
    },
    MutationFailed {
        entity: String,
        entity_id: String,
        mutation_id: String,
        error: String,
        retryable: bool,
    },
    PushOnlyStart,
    PushOnlyComplete {
        pushed: usize,
        failed: usize,
    },
    PushOnlyError {
        message: String,
    },
    OnlineDetected,
    OfflineDetected,
}

impl SyncEvent {
    /// Wire name of the event, e.g. `"entity_sync_complete"`.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::SyncStart { .. } => "sync_start",
            SyncEvent::SyncComplete { .. } => "sync_complete",
            SyncEvent::SyncError { .. } => "sync_error",
            SyncEvent::EntitySyncStart { .. } => "entity_sync_start",
            SyncEvent::EntitySyncComplete { .. } => "entity_sync_complete",
            SyncEvent::SyncRetry { .. } => "sync_retry",
            SyncEvent::SyncRetryExhausted { .. } => "sync_retry_exhausted",
            SyncEvent::MutationPushed { .. } => "mutation_pushed",
            SyncEvent::MutationFailed { .. } => "mutation_failed",
            SyncEvent::PushOnlyStart => "push_only_start",
            SyncEvent::PushOnlyComplete { .. } => "push_only_complete",
            SyncEvent::PushOnlyError { .. } => "push_only_error",
            SyncEvent::OnlineDetected => "online_detected",
            SyncEvent::OfflineDetected => "offline_detected",
        }
    }
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives engine events (implemented by the app shell).
pub trait SyncEventEmitter: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// No-op event emitter for testing and headless use.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit(&self, _event: SyncEvent) {}
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events; emitting never waits.
pub struct BroadcastEmitter {
    tx: broadcast::Sender<SyncEvent>,
}

impl BroadcastEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        BroadcastEmitter { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl SyncEventEmitter for BroadcastEmitter {
    fn emit(&self, event: SyncEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
