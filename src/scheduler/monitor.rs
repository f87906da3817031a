use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::scheduler::coordinator::Coordinator;

/// Periodically reclaims jobs whose holders stopped heartbeating.
pub struct LivenessMonitor {
    coordinator: Arc<Coordinator>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(coordinator: Arc<Coordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    /// Scan for expired leases every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Liveness monitor stopped");
                    break;
                }
                _ = interval.tick() => {
                    let reclaimed = self.coordinator.reclaim_expired().await;
                    if reclaimed > 0 {
                        tracing::info!(reclaimed, "Reclaimed jobs from unresponsive workers");
                    }
                }
            }
        }
    }
}
