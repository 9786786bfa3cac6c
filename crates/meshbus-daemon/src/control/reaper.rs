//! Advertisement-cache reaper.
//!
//! Removes expired entries from the received-advertisement cache and emits
//! `LostAdvertisedName` to interested subscribers. Instead of a fixed-period
//! sleep, the task waits until the earliest expiry and is re-armed by a
//! `Notify` whenever the cache gains entries, so wakeups neither drift nor
//! lag. Cancellation is prompt via the daemon's shutdown token.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ControlObject;

/// Runs the reaper until `cancel` fires. Spawned once at bus bring-up.
pub async fn run(control: Arc<ControlObject>, notify: Arc<Notify>, cancel: CancellationToken) {
    debug!("name-map reaper running");
    loop {
        let next_expiry = control.next_name_map_expiry();
        tokio::select! {
            () = cancel.cancelled() => break,
            () = notify.notified() => {
                // New entries may have moved the earliest expiry forward.
                continue;
            }
            () = sleep_until_or_forever(next_expiry) => {
                control.reap_name_map();
            }
        }
    }
    debug!("name-map reaper stopped");
}

async fn sleep_until_or_forever(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
