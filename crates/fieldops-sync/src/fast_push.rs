//! # Fast Push
//!
//! Chooses between a push-only drain and a full sync when the app asks
//! for "sync now" (e.g. after saving a form).
//!
//! ```text
//! trigger()
//!   ├── already running ─────────────────────────────► Throttled (dropped)
//!   ├── full sync finished < cooldown ago ───────────► PushOnly
//!   └── otherwise (or never) ────────────────────────► FullSync
//! ```
//!
//! The service learns about finished full syncs through
//! [`SyncCompletionObserver`]; it never polls engine state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::engine::SyncEngine;
use crate::flight::SingleFlight;

/// A sync entry point invoked by the service.
pub type SyncCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Told by the engine after each successful full sync.
pub trait SyncCompletionObserver: Send + Sync {
    fn full_sync_completed(&self);
}

/// What a trigger ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPushAction {
    PushOnly,
    FullSync,
    Throttled,
}

const NEVER: u64 = u64::MAX;

pub struct FastPushService {
    push_only: SyncCallback,
    full_sync: SyncCallback,
    cooldown: Duration,
    epoch: Instant,
    /// Millis since `epoch` of the last full sync, or [`NEVER`].
    last_full_sync: AtomicU64,
    running: SingleFlight,
}

impl FastPushService {
    pub fn new(push_only: SyncCallback, full_sync: SyncCallback, cooldown: Duration) -> Self {
        FastPushService {
            push_only,
            full_sync,
            cooldown,
            epoch: Instant::now(),
            last_full_sync: AtomicU64::new(NEVER),
            running: SingleFlight::new(),
        }
    }

    /// Wires a service to `engine` and registers it for completion
    /// notifications.
    ///
    /// The callbacks hold the engine weakly.
    pub async fn for_engine(engine: &Arc<SyncEngine>, cooldown: Duration) -> Arc<Self> {
        let weak = Arc::downgrade(engine);
        let push_only: SyncCallback = Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(engine) = weak.upgrade() {
                    if let Err(e) = engine.push_only().await {
                        warn!(error = %e, "Fast push failed");
                    }
                }
            }
            .boxed()
        });

        let weak = Arc::downgrade(engine);
        let full_sync: SyncCallback = Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(engine) = weak.upgrade() {
                    if let Err(e) = engine.sync_all().await {
                        warn!(error = %e, "Full sync from fast push failed");
                    }
                }
            }
            .boxed()
        });

        let service = Arc::new(FastPushService::new(push_only, full_sync, cooldown));
        engine.add_completion_observer(service.clone()).await;
        service
    }

    /// Runs the cheaper path when a full sync happened recently.
    pub async fn trigger(&self) -> FastPushAction {
        let Some(_running) = self.running.try_acquire() else {
            debug!("Fast push already running, trigger dropped");
            return FastPushAction::Throttled;
        };

        if self.within_cooldown() {
            debug!("Recent full sync, pushing only");
            (self.push_only)().await;
            FastPushAction::PushOnly
        } else {
            debug!("No recent full sync, running full sync");
            (self.full_sync)().await;
            FastPushAction::FullSync
        }
    }

    fn within_cooldown(&self) -> bool {
        let last = self.last_full_sync.load(Ordering::Acquire);
        if last == NEVER {
            return false;
        }
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(last)) < self.cooldown
    }
}

impl SyncCompletionObserver for FastPushService {
    fn full_sync_completed(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_full_sync.store(now, Ordering::Release);
    }
}
