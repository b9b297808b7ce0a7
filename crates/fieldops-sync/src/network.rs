//! # Network State
//!
//! Connectivity as seen by the engine, and the monitor that turns
//! transitions into sync attempts.
//!
//! ## Transitions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   offline ──► online    emit online_detected                            │
//! │                         spawn sync_with_retry (terminal failure is      │
//! │                         only logged and emitted)                        │
//! │                                                                         │
//! │   online ──► offline    emit offline_detected                           │
//! │                         pending retry sleeps wake up cancelled          │
//! │                         no new entities / checklist units start         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The platform layer owns the `watch::Sender<bool>` and publishes `true`
//! for online. In-flight requests are never aborted.

use std::sync::Weak;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;
use crate::events::SyncEvent;

/// Read side of the connectivity channel.
#[derive(Debug, Clone)]
pub struct Connectivity {
    rx: watch::Receiver<bool>,
}

impl Connectivity {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Connectivity { rx }
    }

    /// Connectivity that never changes from online.
    pub fn always_online() -> Self {
        let (_tx, rx) = watch::channel(true);
        Connectivity { rx }
    }

    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the device goes (or already is) offline.
    ///
    /// Never resolves if the sender is gone while online.
    pub async fn offline(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|online| !*online).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

/// Watches connectivity on behalf of an engine.
///
/// Holds the engine weakly: dropping the engine stops the monitor.
///
/// Transitions are judged against the state seen at construction, so a
/// change published before the spawned loop first runs is not lost.
pub struct NetworkMonitor {
    engine: Weak<SyncEngine>,
    rx: watch::Receiver<bool>,
    was_online: bool,
}

impl NetworkMonitor {
    pub fn new(engine: Weak<SyncEngine>, connectivity: &Connectivity) -> Self {
        NetworkMonitor {
            engine,
            was_online: connectivity.is_online(),
            rx: connectivity.subscribe(),
        }
    }

    /// Spawns the monitor loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the sender or the engine goes away.
    pub async fn run(mut self) {
        debug!(online = self.was_online, "Network monitor starting");

        loop {
            let online = *self.rx.borrow_and_update();
            if online != self.was_online {
                self.was_online = online;
                if !self.transition(online) {
                    break;
                }
            }
            if self.rx.changed().await.is_err() {
                break;
            }
        }

        debug!("Network monitor stopped");
    }

    /// Reacts to one transition. Returns false once the engine is gone.
    fn transition(&self, online: bool) -> bool {
        let Some(engine) = self.engine.upgrade() else {
            return false;
        };

        if online {
            info!("Connectivity restored");
            engine.emit(SyncEvent::OnlineDetected);
            tokio::spawn(async move {
                if let Err(e) = engine.sync_with_retry().await {
                    warn!(error = %e, "Sync after reconnect did not succeed");
                }
            });
        } else {
            info!("Connectivity lost");
            engine.emit(SyncEvent::OfflineDetected);
        }
        true
    }
}
