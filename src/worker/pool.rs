use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::scheduler::coordinator::{
    Assignment, AttemptResult, CommitOutcome, Coordinator, WorkerOutcome,
};
use crate::storage::BlobStore;
use crate::worker::executor::{ExecutionResult, SliceRequest, SlicerExecutor};
use crate::worker::heartbeat::HeartbeatSender;

#[derive(Debug, Default)]
struct PoolStats {
    running: AtomicUsize,
    held: AtomicUsize,
    peak_running: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time view of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    /// Executions holding a slot
    pub running: usize,
    /// Claimed jobs waiting for a slot
    pub held: usize,
    pub peak_running: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Outcomes dropped because the worker had lost its lease
    pub discarded: u64,
}

/// How the pool stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolShutdown {
    /// Every job finished inside the drain window
    pub drained: bool,
    /// Every task exited before the kill grace ran out
    pub clean: bool,
    /// Jobs whose leases were released without an outcome
    pub abandoned: usize,
}

struct PoolShared {
    config: WorkerConfig,
    coordinator: Arc<Coordinator>,
    blobs: Arc<dyn BlobStore>,
    executor: Arc<dyn SlicerExecutor>,
    /// Claimed but unfinished jobs: slots plus holding area
    admission: Arc<Semaphore>,
    /// Concurrent executions
    slots: Arc<Semaphore>,
    stats: PoolStats,
    tracker: TaskTracker,
    stop_claiming: CancellationToken,
    /// Asks executors to stop
    abort: CancellationToken,
    /// Drops executions that ignored `abort`
    force: CancellationToken,
    /// Job id to worker id for every spawned job task
    inflight: std::sync::Mutex<HashMap<Uuid, String>>,
}

/// Bounded pool of slicer executions fed by `count` claim loops.
///
/// At most `max_concurrent` executions run at once and at most
/// `holding_capacity` more claimed jobs wait for a slot. When both are full
/// the claim loops stop claiming.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        coordinator: Arc<Coordinator>,
        blobs: Arc<dyn BlobStore>,
        executor: Arc<dyn SlicerExecutor>,
    ) -> Self {
        let admission = Arc::new(Semaphore::new(
            config.max_concurrent + config.holding_capacity,
        ));
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            shared: Arc::new(PoolShared {
                config,
                coordinator,
                blobs,
                executor,
                admission,
                slots,
                stats: PoolStats::default(),
                tracker: TaskTracker::new(),
                stop_claiming: CancellationToken::new(),
                abort: CancellationToken::new(),
                force: CancellationToken::new(),
                inflight: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Spawn the claim loops, named `<consumer_prefix>-<n>`.
    pub fn start(&self) {
        for n in 1..=self.shared.config.count {
            let consumer = format!("{}-{}", self.shared.config.consumer_prefix, n);
            let shared = self.shared.clone();
            self.shared
                .tracker
                .spawn(async move { shared.claim_loop(consumer).await });
        }
        tracing::info!(
            workers = self.shared.config.count,
            max_concurrent = self.shared.config.max_concurrent,
            holding_capacity = self.shared.config.holding_capacity,
            "Worker pool started"
        );
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        let s = &self.shared.stats;
        PoolStatsSnapshot {
            running: s.running.load(Ordering::SeqCst),
            held: s.held.load(Ordering::SeqCst),
            peak_running: s.peak_running.load(Ordering::SeqCst),
            succeeded: s.succeeded.load(Ordering::SeqCst),
            failed: s.failed.load(Ordering::SeqCst),
            cancelled: s.cancelled.load(Ordering::SeqCst),
            discarded: s.discarded.load(Ordering::SeqCst),
        }
    }

    /// Stop claiming, let in-flight jobs finish for `drain_timeout`, then
    /// stop what is left within `kill_grace`.
    ///
    /// The first half of the grace asks executors to stop. Executions still
    /// running after it are dropped, which kills their processes. Jobs that
    /// still have not reported when the grace runs out lose their leases.
    pub async fn shutdown(&self, drain_timeout: Duration, kill_grace: Duration) -> PoolShutdown {
        let shared = &self.shared;
        shared.stop_claiming.cancel();
        shared.tracker.close();

        if tokio::time::timeout(drain_timeout, shared.tracker.wait())
            .await
            .is_ok()
        {
            tracing::info!("Worker pool drained");
            return PoolShutdown {
                drained: true,
                clean: true,
                abandoned: 0,
            };
        }

        let stats = self.stats();
        tracing::warn!(
            running = stats.running,
            held = stats.held,
            "Drain timed out, cancelling remaining jobs"
        );
        shared.abort.cancel();

        let deadline = tokio::time::Instant::now() + kill_grace;
        let ask = kill_grace / 2;
        if tokio::time::timeout(ask, shared.tracker.wait()).await.is_ok() {
            return PoolShutdown {
                drained: false,
                clean: true,
                abandoned: 0,
            };
        }

        tracing::warn!("Executions ignored cancellation, forcing them down");
        shared.force.cancel();
        if tokio::time::timeout_at(deadline, shared.tracker.wait())
            .await
            .is_ok()
        {
            return PoolShutdown {
                drained: false,
                clean: true,
                abandoned: 0,
            };
        }

        let stuck: Vec<(Uuid, String)> = shared
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(job_id, worker_id)| (*job_id, worker_id.clone()))
            .collect();
        let mut abandoned = 0;
        for (job_id, worker_id) in stuck {
            if shared.coordinator.abandon(job_id, &worker_id).await {
                abandoned += 1;
            }
        }
        tracing::error!(abandoned, "Jobs still running after kill grace, leases released");
        PoolShutdown {
            drained: false,
            clean: false,
            abandoned,
        }
    }
}

impl PoolShared {
    async fn claim_loop(self: Arc<Self>, consumer: String) {
        tracing::info!(worker = %consumer, "Claim loop started");

        loop {
            // Back-pressure: no free admission permit, no claim
            let first = tokio::select! {
                _ = self.stop_claiming.cancelled() => break,
                permit = self.admission.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let mut permits = vec![first];
            while let Ok(permit) = self.admission.clone().try_acquire_owned() {
                permits.push(permit);
            }

            let assignments = match self.coordinator.claim_batch(&consumer, permits.len()).await {
                Ok(assignments) => assignments,
                Err(e) => {
                    tracing::warn!(worker = %consumer, error = %e, "Claim failed");
                    Vec::new()
                }
            };

            if assignments.is_empty() {
                drop(permits);
                tokio::select! {
                    _ = self.stop_claiming.cancelled() => break,
                    _ = tokio::time::sleep(self.config.claim_poll_interval) => continue,
                }
            }

            for (assignment, permit) in assignments.into_iter().zip(permits.drain(..)) {
                self.stats.held.fetch_add(1, Ordering::SeqCst);
                let shared = self.clone();
                self.tracker
                    .spawn(async move { shared.run_job(assignment, permit).await });
            }
        }

        tracing::info!(worker = %consumer, "Claim loop stopped");
    }

    async fn run_job(self: Arc<Self>, assignment: Assignment, _admission: OwnedSemaphorePermit) {
        let job_id = assignment.job_id;
        let worker_id = assignment.worker_id.clone();
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, worker_id.clone());
        let cancel = self.abort.child_token();
        let done = CancellationToken::new();

        let heartbeat = HeartbeatSender::new(self.config.heartbeat_interval);
        let coordinator = &self.coordinator;
        let beat = || coordinator.heartbeat(job_id, &worker_id);

        let supervise = async {
            tokio::select! {
                result = heartbeat.run(beat, &done) => {
                    if let Err(e) = result {
                        tracing::warn!(job_id = %job_id, worker = %worker_id, error = %e, "Heartbeat failed, aborting job");
                        cancel.cancel();
                    }
                }
                _ = assignment.cancel.cancelled() => {
                    tracing::warn!(job_id = %job_id, worker = %worker_id, "Lease revoked, aborting job");
                    cancel.cancel();
                }
            }
        };
        let work = async {
            let result = self.attempt(&assignment, &cancel).await;
            done.cancel();
            result
        };
        let (result, ()) = tokio::join!(work, supervise);

        let committed = self
            .coordinator
            .commit(WorkerOutcome {
                job_id,
                worker_id: worker_id.clone(),
                result: result.clone(),
            })
            .await;

        let stats = &self.stats;
        match committed {
            Ok(CommitOutcome::Succeeded) => {
                stats.succeeded.fetch_add(1, Ordering::SeqCst);
            }
            Ok(CommitOutcome::Discarded) => {
                stats.discarded.fetch_add(1, Ordering::SeqCst);
            }
            Ok(CommitOutcome::Requeued { .. }) | Ok(CommitOutcome::DeadLettered { .. }) => {
                if result == AttemptResult::Cancelled {
                    stats.cancelled.fetch_add(1, Ordering::SeqCst);
                } else {
                    stats.failed.fetch_add(1, Ordering::SeqCst);
                }
            }
            Err(e) => {
                // The lease runs out and the monitor reclaims the job
                tracing::error!(job_id = %job_id, worker = %worker_id, error = %e, "Failed to commit outcome");
            }
        }

        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
    }

    /// Wait for a slot, then execute. Cancellation while waiting or running
    /// reports `Cancelled`.
    async fn attempt(&self, assignment: &Assignment, cancel: &CancellationToken) -> AttemptResult {
        let slot = tokio::select! {
            permit = self.slots.clone().acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        };
        self.stats.held.fetch_sub(1, Ordering::SeqCst);
        let Some(_slot) = slot else {
            return AttemptResult::Cancelled;
        };

        let running = self.stats.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_running.fetch_max(running, Ordering::SeqCst);

        let result = self.execute(assignment, cancel).await;

        self.stats.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn execute(&self, assignment: &Assignment, cancel: &CancellationToken) -> AttemptResult {
        let job_id = assignment.job_id;
        if let Err(e) = self
            .coordinator
            .mark_running(job_id, &assignment.worker_id)
            .await
        {
            tracing::warn!(job_id = %job_id, error = %e, "Cannot start job");
            return AttemptResult::Cancelled;
        }

        match self.blobs.exists(&assignment.model_path).await {
            Ok(true) => {}
            Ok(false) => {
                return AttemptResult::Failed(format!(
                    "model {} not found",
                    assignment.model_path.display()
                ))
            }
            Err(e) => return AttemptResult::Failed(e.to_string()),
        }

        // The executor enforces the timeout itself
        let request = SliceRequest {
            job_id,
            input: assignment.model_path.clone(),
            output: self.blobs.output_path(job_id),
            params: assignment.params.clone(),
            timeout: self.config.worker_timeout,
        };

        let execution = tokio::select! {
            result = self.executor.run(&request, cancel.clone()) => match result {
                Ok(execution) => execution,
                Err(e) => return AttemptResult::Failed(e.to_string()),
            },
            // Dropping the run future kills the process
            _ = self.force.cancelled() => {
                tracing::warn!(job_id = %job_id, "Slicer ignored cancellation, dropped");
                ExecutionResult::Cancelled
            }
        };

        match execution {
            ExecutionResult::Completed { .. } => self.store_output(job_id, &request.output).await,
            _ if cancel.is_cancelled() => AttemptResult::Cancelled,
            ExecutionResult::Cancelled => AttemptResult::Cancelled,
            failed => AttemptResult::Failed(
                failed
                    .failure()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "slicer failed".to_string()),
            ),
        }
    }

    async fn store_output(&self, job_id: Uuid, output: &Path) -> AttemptResult {
        let data = match self.blobs.read(output).await {
            Ok(data) => data,
            Err(e) => return AttemptResult::Failed(format!("slicer produced no output: {e}")),
        };
        match self.blobs.store_result(job_id, &data).await {
            Ok(location) => {
                if let Err(e) = tokio::fs::remove_file(output).await {
                    tracing::debug!(job_id = %job_id, error = %e, "Scratch output not removed");
                }
                AttemptResult::Succeeded {
                    location,
                    size: data.len() as u64,
                }
            }
            Err(e) => AttemptResult::Failed(e.to_string()),
        }
    }
}
