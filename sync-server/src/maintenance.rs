//! Background maintenance task.
//!
//! Periodically evicts rate limiter entries for organizations whose watch
//! quota has fully recharged, so idle organizations stop holding memory.

use crate::limits::RateLimits;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// How often limiter state is shrunk.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the maintenance task.
///
/// The task exits when `shutdown` is cancelled.
pub fn spawn_maintenance_task(
    rate_limits: RateLimits,
    every: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_secs = every.as_secs(), "maintenance task started");
        let mut timer = interval(every);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    let before = rate_limits.watch_keys_count();
                    rate_limits.shrink();
                    let after = rate_limits.watch_keys_count();
                    if before > after {
                        tracing::debug!(evicted = before - after, "shrunk watch limiter");
                    }
                }
            }
        }

        tracing::info!("maintenance task stopped");
    })
}
