//! Backoff sleeps that give up when the device goes offline.

use std::time::Duration;

use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::network::Connectivity;

/// Sleeps for `delay` unless connectivity drops first.
///
/// Returns [`SyncError::RetryCancelled`] immediately if the device is
/// already offline or goes offline during the sleep.
pub async fn sleep_unless_offline(delay: Duration, connectivity: &Connectivity) -> SyncResult<()> {
    if !connectivity.is_online() {
        return Err(SyncError::RetryCancelled);
    }

    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = connectivity.offline() => {
            debug!(?delay, "Backoff cancelled, device went offline");
            Err(SyncError::RetryCancelled)
        }
    }
}
