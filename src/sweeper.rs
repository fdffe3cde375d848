//! Background sweeper reconciling time-based state.
//!
//! Every sweep interval, leases whose deadline has passed are reclaimed and
//! resolved as nack-with-requeue. Delayed messages need no dedicated pass:
//! the eligibility scan in `lease_next` surfaces them lazily once their
//! `available_at_ms` arrives.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::manager::QueueManager;

const SWEEP_BATCH: u32 = 256;

/// Runs until cancelled. Backend failures are logged and the loop carries
/// on; a broken sweep pass must never take the broker down.
pub async fn run(manager: Arc<QueueManager>, interval_ms: u64, shutdown: CancellationToken) {
    let period = Duration::from_millis(interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(interval_ms, "lease sweeper started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match manager.sweep_expired(SWEEP_BATCH).await {
            Ok(0) => {}
            Ok(reclaimed) => {
                tracing::info!(reclaimed, "sweep reclaimed expired leases");
            }
            Err(e) => {
                tracing::warn!(error = %e, "sweep pass failed, will retry next interval");
            }
        }
    }

    tracing::info!("lease sweeper stopped");
}
