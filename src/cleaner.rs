//! Background eviction of idle cursor entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::store::ResourceStore;

/// Periodic sweep over the registry.
///
/// An entry is evicted only when nothing references it, nothing holds its
/// lock, its last write is synced, and it has been idle for at least its
/// configured clean timeout. Everything else is left for a later pass.
pub(crate) struct Cleaner {
    store: Arc<ResourceStore>,
    interval: Duration,
}

impl Cleaner {
    pub(crate) fn new(store: Arc<ResourceStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Sweep every `interval` until `cancel` fires. Removal failures are
    /// logged by the store and retried on the next pass; they never stop the
    /// loop.
    pub(crate) async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            interval = %humantime::format_duration(self.interval),
            "Started cursor store cleanup"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it so the first sweep
        // runs one full interval after start.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tracing::debug!("Start store cleanup");
                    let stats = self.store.remove_idle(Utc::now());
                    tracing::debug!(
                        removed = stats.removed,
                        failed = stats.failed,
                        "Done store cleanup"
                    );
                }
            }
        }
        tracing::info!("Stopped cursor store cleanup");
    }
}
