use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cache::{ResultCache, INDEX_FILE};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::queue::{JobQueueClient, StreamBackend};
use crate::scheduler::{Coordinator, JobRecordStore, LivenessMonitor, SubmissionApi};
use crate::storage::BlobStore;
use crate::worker::{PoolStatsSnapshot, SlicerExecutor, WorkerPool};

/// Outcome of [`Engine::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight job finished inside the drain window
    pub drained: bool,
    /// Every cancelled job reported back before the deadline
    pub clean: bool,
    /// Jobs whose leases were released without an outcome
    pub abandoned: usize,
    pub elapsed: Duration,
    pub stats: PoolStatsSnapshot,
}

/// Composition root: wires the queue, cache, coordinator, monitor and
/// worker pool from one configuration value.
///
/// The cache index and the records of finished jobs live under
/// `storage.results_path`, next to the artifacts they describe.
pub struct Engine {
    config: EngineConfig,
    coordinator: Arc<Coordinator>,
    cache: Option<Arc<ResultCache>>,
    pool: WorkerPool,
    background: TaskTracker,
    cancel: CancellationToken,
}

impl Engine {
    /// # Errors
    ///
    /// `InvalidConfig` listing every invalid setting, or an I/O error if an
    /// existing cache index cannot be read.
    pub async fn new(
        config: EngineConfig,
        backend: Arc<dyn StreamBackend>,
        blobs: Arc<dyn BlobStore>,
        executor: Arc<dyn SlicerExecutor>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = if config.cache.enabled {
            let index = config.storage.results_path.join(INDEX_FILE);
            Some(Arc::new(ResultCache::open(config.cache.clone(), index).await?))
        } else {
            None
        };
        let queue = JobQueueClient::new(backend, config.queue.clone());
        let records = JobRecordStore::new(config.storage.records_path());
        let coordinator = Arc::new(
            Coordinator::new(queue, blobs.clone(), cache.clone()).with_records(records),
        );
        let pool = WorkerPool::new(
            config.workers.clone(),
            coordinator.clone(),
            blobs,
            executor,
        );

        Ok(Self {
            config,
            coordinator,
            cache,
            pool,
            background: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start the claim loops, the liveness monitor, the cache cleaner and
    /// the retention cleaner.
    pub fn start(&self) {
        self.pool.start();

        let monitor = LivenessMonitor::new(
            self.coordinator.clone(),
            self.config.workers.heartbeat_interval,
        );
        let cancel = self.cancel.clone();
        self.background
            .spawn(async move { monitor.run(cancel).await });

        if let Some(cache) = &self.cache {
            let cache = cache.clone();
            let cancel = self.cancel.clone();
            self.background
                .spawn(async move { cache.run_cleaner(cancel).await });
        }

        let storage = &self.config.storage;
        if storage.cleanup_enabled {
            let coordinator = self.coordinator.clone();
            let cancel = self.cancel.clone();
            let (retention, interval) = (storage.retention, storage.cleanup_interval);
            self.background.spawn(async move {
                coordinator.run_retention(retention, interval, cancel).await
            });
        }

        tracing::info!(
            stream = %self.config.queue.stream_name,
            group = %self.config.queue.consumer_group,
            cache = self.cache.is_some(),
            "Engine started"
        );
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    pub fn submission(&self) -> Arc<dyn SubmissionApi> {
        self.coordinator.clone()
    }

    pub fn cache(&self) -> Option<Arc<ResultCache>> {
        self.cache.clone()
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.pool.stats()
    }

    /// Stop claiming, drain in-flight jobs for `timeout - kill_grace`, then
    /// cancel and requeue whatever is still running. Jobs that cannot be
    /// stopped in time lose their leases.
    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        let shutdown = &self.config.shutdown;
        tracing::info!(timeout = ?shutdown.timeout, "Engine shutting down");

        let pool = self
            .pool
            .shutdown(shutdown.drain_timeout(), shutdown.kill_grace)
            .await;

        self.cancel.cancel();
        self.background.close();
        self.background.wait().await;

        let report = ShutdownReport {
            drained: pool.drained,
            clean: pool.clean,
            abandoned: pool.abandoned,
            elapsed: started.elapsed(),
            stats: self.pool.stats(),
        };
        tracing::info!(
            drained = report.drained,
            clean = report.clean,
            abandoned = report.abandoned,
            elapsed_ms = report.elapsed.as_millis() as u64,
            succeeded = report.stats.succeeded,
            cancelled = report.stats.cancelled,
            "Engine stopped"
        );
        report
    }
}
