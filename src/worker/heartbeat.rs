use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Renews a job lease on a fixed interval while the job is held.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Call `beat` every interval until `stop` fires (`Ok`) or a beat fails
    /// (that beat's error). The first beat happens one interval after start.
    pub async fn run<F, Fut>(&self, mut beat: F, stop: &CancellationToken) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = interval.tick() => beat().await?,
            }
        }
    }
}
