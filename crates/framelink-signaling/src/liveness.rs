//! Periodic liveness sweep.
//!
//! Detects half-open sockets behind proxies that drop idle connections without
//! closing them: every interval each connection is probed, and one that has not
//! answered since the previous probe is evicted.

use crate::hub::Hub;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Spawn the sweep loop. Abort the handle to stop it.
pub fn spawn(hub: Arc<Hub>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let report = hub.sweep().await;
            if report.evicted > 0 {
                tracing::info!(probed = report.probed, evicted = report.evicted, "Liveness sweep");
            } else {
                tracing::trace!(probed = report.probed, "Liveness sweep");
            }
        }
    })
}
