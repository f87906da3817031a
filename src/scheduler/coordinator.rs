use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::error::{Result, SlicerError};
use crate::queue::{
    ClaimedJob, DeadLetterEntry, JobQueueClient, NackOutcome, NackReason, QueueMessage,
};
use crate::scheduler::fingerprint::Fingerprint;
use crate::scheduler::job::{AttemptOutcome, Job, JobResult, JobStatus, SliceParams};
use crate::scheduler::lease::LeaseTable;
use crate::scheduler::records::JobRecordStore;
use crate::storage::{model_extension, BlobStore, ModelRef};

/// A claimed job handed to the worker pool.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub job_id: Uuid,
    pub worker_id: String,
    pub fingerprint: Fingerprint,
    pub model_path: PathBuf,
    pub params: SliceParams,
    /// 1-based number of this attempt
    pub attempt: u32,
    /// Cancelled when the lease is taken away
    pub cancel: CancellationToken,
}

/// What a worker proposes for its attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Succeeded { location: PathBuf, size: u64 },
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub job_id: Uuid,
    pub worker_id: String,
    pub result: AttemptResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Succeeded,
    Requeued { attempts: u32, delay: Duration },
    DeadLettered { attempts: u32 },
    /// The worker no longer held the lease; its outcome was dropped
    Discarded,
}

/// Entry point for callers that submit jobs and poll for their results.
#[async_trait]
pub trait SubmissionApi: Send + Sync {
    async fn submit(&self, model: ModelRef, params: SliceParams) -> Result<Uuid>;

    async fn get_status(&self, job_id: Uuid) -> Result<Job>;

    async fn get_result(&self, job_id: Uuid) -> Result<JobResult>;
}

/// Serializes cache writes per fingerprint.
#[derive(Default)]
struct FingerprintLocks {
    locks: std::sync::Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
}

impl FingerprintLocks {
    async fn lock(&self, fingerprint: &Fingerprint) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(fingerprint.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Owner of every job state transition.
///
/// Workers propose outcomes through [`commit`](Self::commit); the
/// coordinator checks the lease, talks to the queue and cache, and only then
/// moves the job. Each job is mutated under its own lock.
pub struct Coordinator {
    queue: JobQueueClient,
    blobs: Arc<dyn BlobStore>,
    cache: Option<Arc<ResultCache>>,
    leases: LeaseTable,
    lease_ttl: Duration,
    jobs: RwLock<HashMap<Uuid, Arc<Mutex<Job>>>>,
    records: Option<JobRecordStore>,
    fingerprint_locks: FingerprintLocks,
    changed: Notify,
}

impl Coordinator {
    pub fn new(
        queue: JobQueueClient,
        blobs: Arc<dyn BlobStore>,
        cache: Option<Arc<ResultCache>>,
    ) -> Self {
        let lease_ttl = queue.config().ack_timeout;
        Self {
            queue,
            blobs,
            cache,
            leases: LeaseTable::new(),
            lease_ttl,
            jobs: RwLock::new(HashMap::new()),
            records: None,
            fingerprint_locks: FingerprintLocks::default(),
            changed: Notify::new(),
        }
    }

    /// Keep finished jobs in `records` so they outlive the process.
    pub fn with_records(mut self, records: JobRecordStore) -> Self {
        self.records = Some(records);
        self
    }

    // ------------------------------------------------------------------
    // Submission side
    // ------------------------------------------------------------------

    /// Store the model, fingerprint it and enqueue the job. A fingerprint
    /// already in the cache completes the job immediately.
    pub async fn submit(&self, model: ModelRef, params: SliceParams) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        let (fingerprint, model_path, uploaded) = match model {
            ModelRef::Bytes { name, data } => {
                model_extension(&name)?;
                let fingerprint = Fingerprint::compute(&data, &params);
                let path = self.blobs.store_model(job_id, &name, &data).await?;
                (fingerprint, path, true)
            }
            ModelRef::Stored(path) => {
                model_extension(&path.to_string_lossy())?;
                let data = self.blobs.read(&path).await?;
                (Fingerprint::compute(&data, &params), path, false)
            }
        };

        let mut job = Job::with_id(job_id, fingerprint.clone(), model_path, params);

        if let Some(location) = self.cached_result(&fingerprint).await {
            tracing::info!(
                job_id = %job_id,
                fingerprint = %fingerprint,
                result = %location.display(),
                "Cache hit, job completed without slicing"
            );
            job.result_path = Some(location);
            job.transition(JobStatus::Succeeded)?;
            self.save_record(&job).await;
            self.insert_job(job);
            self.changed.notify_waiters();
            return Ok(job_id);
        }

        let message = QueueMessage {
            job_id,
            fingerprint,
            model_path: job.model_path.clone(),
            params: job.params.clone(),
            enqueued_at: job.enqueued_at,
            attempts: 0,
            last_error: None,
        };

        // Visible before the enqueue so a fast claim finds the record
        self.insert_job(job);
        if let Err(e) = self.queue.enqueue(&message).await {
            self.jobs
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&job_id);
            // Nothing will ever slice the upload
            if uploaded {
                if let Err(remove_err) = self.blobs.remove(&message.model_path).await {
                    tracing::warn!(job_id = %job_id, error = %remove_err, "Failed to remove model of rejected job");
                }
            }
            return Err(e);
        }

        tracing::info!(
            job_id = %job_id,
            fingerprint = %message.fingerprint,
            model = %message.model_path.display(),
            "Job submitted"
        );
        Ok(job_id)
    }

    /// Current record of the job. Jobs finished before a restart are served
    /// from their stored record.
    pub async fn get_status(&self, job_id: Uuid) -> Result<Job> {
        let job = self.job_or_record(job_id).await?;
        let job = job.lock().await;
        Ok(job.clone())
    }

    pub async fn get_result(&self, job_id: Uuid) -> Result<JobResult> {
        let job = self.get_status(job_id).await?;
        Ok(match job.status {
            JobStatus::Succeeded => match job.result_path {
                Some(path) => JobResult::Ready(path),
                None => {
                    return Err(SlicerError::Internal(format!(
                        "job {job_id} succeeded without a result"
                    )))
                }
            },
            JobStatus::DeadLettered => JobResult::Failed(job.dead_letter_report()),
            status => JobResult::NotReady(status),
        })
    }

    /// Block until the job is terminal or `timeout` elapses, then return
    /// its current record.
    pub async fn wait(&self, job_id: Uuid, timeout: Duration) -> Result<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let job = self.get_status(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(job);
            }
        }
    }

    /// Every known job, oldest submission first.
    pub async fn list(&self) -> Vec<Job> {
        let handles: Vec<Arc<Mutex<Job>>> = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut jobs = Vec::with_capacity(handles.len());
        for handle in handles {
            jobs.push(handle.lock().await.clone());
        }
        jobs.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        self.queue.dead_letters().await
    }

    pub fn live_leases(&self) -> usize {
        self.leases.live_count()
    }

    // ------------------------------------------------------------------
    // Worker side
    // ------------------------------------------------------------------

    /// Claim up to `max_count` jobs for `worker_id` and lease them.
    ///
    /// Duplicate deliveries, jobs leased elsewhere and cache hits are
    /// resolved here and never reach the pool.
    pub async fn claim_batch(&self, worker_id: &str, max_count: usize) -> Result<Vec<Assignment>> {
        let claimed = self.queue.claim_batch(worker_id, max_count).await?;
        let mut assignments = Vec::with_capacity(claimed.len());

        for claim in claimed {
            let job_id = claim.job_id();
            match self.admit(claim, worker_id).await {
                Ok(Some(assignment)) => assignments.push(assignment),
                Ok(None) => {}
                Err(e) => {
                    // Entry stays pending and is redelivered after the ack timeout
                    tracing::error!(job_id = %job_id, worker = worker_id, error = %e, "Failed to admit claimed job");
                }
            }
        }
        Ok(assignments)
    }

    async fn admit(&self, claim: ClaimedJob, worker_id: &str) -> Result<Option<Assignment>> {
        let job_id = claim.job_id();
        let handle = self.job_entry(&claim.message).await;
        let mut job = handle.lock().await;

        if job.status.is_terminal() {
            tracing::info!(
                job_id = %job_id,
                entry_id = %claim.entry_id,
                status = %job.status,
                "Duplicate delivery of finished job, acknowledging"
            );
            self.queue.ack(&claim).await?;
            return Ok(None);
        }

        let acquired = match self.leases.try_acquire(&claim, worker_id, self.lease_ttl) {
            Ok(acquired) => acquired,
            Err(conflict) => {
                tracing::warn!(
                    job_id = %job_id,
                    holder = %conflict.holder,
                    claimant = worker_id,
                    "Job already leased, dropping duplicate claim"
                );
                if conflict.entry_id != claim.entry_id {
                    self.queue.ack(&claim).await?;
                }
                return Ok(None);
            }
        };

        job.attempts = job.attempts.max(claim.message.attempts);

        // The previous holder vanished without reporting
        if matches!(job.status, JobStatus::Claimed | JobStatus::Running) {
            let previous = acquired
                .expired_predecessor
                .map(|lease| lease.worker_id)
                .or_else(|| job.worker_id.clone())
                .unwrap_or_default();
            let outcome = self.expire_attempt(&mut job, &claim, &previous).await;
            self.leases.release(job_id, worker_id);
            outcome?;
            self.changed.notify_waiters();
            return Ok(None);
        }

        if let Some(location) = self.cached_result(&job.fingerprint).await {
            job.transition(JobStatus::Claimed)?;
            job.result_path = Some(location);
            job.worker_id = None;
            job.transition(JobStatus::Succeeded)?;
            self.save_record(&job).await;
            if let Err(e) = self.queue.ack(&claim).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to ack cache-hit entry");
            }
            self.leases.release(job_id, worker_id);
            self.changed.notify_waiters();
            tracing::info!(job_id = %job_id, fingerprint = %job.fingerprint, "Claimed job served from cache");
            return Ok(None);
        }

        if let Err(e) = job.transition(JobStatus::Claimed) {
            self.leases.release(job_id, worker_id);
            return Err(e);
        }
        job.worker_id = Some(worker_id.to_string());
        job.last_claimed_at = Some(Utc::now());

        let attempt = claim.message.attempts + 1;
        tracing::info!(
            job_id = %job_id,
            worker = worker_id,
            attempt,
            delivery = claim.delivery_count,
            "Job claimed"
        );

        Ok(Some(Assignment {
            job_id,
            worker_id: worker_id.to_string(),
            fingerprint: job.fingerprint.clone(),
            model_path: job.model_path.clone(),
            params: job.params.clone(),
            attempt,
            cancel: acquired.cancel,
        }))
    }

    pub async fn mark_running(&self, job_id: Uuid, worker_id: &str) -> Result<()> {
        let handle = self.job(job_id)?;
        let mut job = handle.lock().await;
        if self.leases.held_by(job_id, worker_id).is_none() {
            return Err(SlicerError::LeaseExpired(job_id));
        }
        job.transition(JobStatus::Running)?;
        tracing::debug!(job_id = %job_id, worker = worker_id, "Job running");
        Ok(())
    }

    /// Renew the worker's lease and reset the idle time of its stream entry.
    ///
    /// # Errors
    ///
    /// `LeaseExpired` if the worker no longer holds the job; the caller must
    /// abort the execution. Stream failures are only logged.
    pub async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<()> {
        let claim = self.leases.renew(job_id, worker_id, self.lease_ttl)?;
        match self.queue.touch(&claim).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job_id = %job_id, entry_id = %claim.entry_id, "Heartbeat for entry no longer pending");
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, worker = worker_id, error = %e, "Failed to touch stream entry");
            }
        }
        Ok(())
    }

    /// Commit a worker's outcome. Outcomes from workers that lost their
    /// lease are discarded.
    pub async fn commit(&self, outcome: WorkerOutcome) -> Result<CommitOutcome> {
        let WorkerOutcome {
            job_id,
            worker_id,
            result,
        } = outcome;
        let handle = self.job(job_id)?;
        let mut job = handle.lock().await;

        let Some(claim) = self.leases.held_by(job_id, &worker_id) else {
            tracing::warn!(
                job_id = %job_id,
                worker = %worker_id,
                "Outcome from worker without a live lease discarded"
            );
            return Ok(CommitOutcome::Discarded);
        };

        let committed = match result {
            AttemptResult::Succeeded { location, size } => {
                if let Some(cache) = &self.cache {
                    let _guard = self.fingerprint_locks.lock(&job.fingerprint).await;
                    if cache.put(job.fingerprint.clone(), location.clone(), size) {
                        if let Err(e) = cache.persist().await {
                            tracing::warn!(job_id = %job_id, error = %e, "Failed to write cache index");
                        }
                    }
                }
                job.attempts = claim.message.attempts + 1;
                job.result_path = Some(location.clone());
                job.error = None;
                job.record_attempt(&worker_id, AttemptOutcome::Succeeded, None);
                job.transition(JobStatus::Succeeded)?;
                job.worker_id = None;
                self.save_record(&job).await;
                // Cached and recorded before the ack; a redelivery is acknowledged as a duplicate
                if let Err(e) = self.queue.ack(&claim).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to ack completed job");
                }
                tracing::info!(
                    job_id = %job_id,
                    worker = %worker_id,
                    attempts = job.attempts,
                    result = %location.display(),
                    "Job succeeded"
                );
                CommitOutcome::Succeeded
            }
            AttemptResult::Failed(detail) => {
                let nack = self
                    .queue
                    .nack(&claim, NackReason::Failed(detail.clone()))
                    .await?;
                job.error = Some(detail.clone());
                job.transition(JobStatus::Failed)?;
                let committed =
                    Self::apply_nack(&mut job, &worker_id, AttemptOutcome::Failed, Some(detail), nack)?;
                if job.status.is_terminal() {
                    self.save_record(&job).await;
                }
                committed
            }
            AttemptResult::Cancelled => {
                let nack = self.queue.nack(&claim, NackReason::Cancelled).await?;
                job.transition(JobStatus::Cancelled)?;
                Self::apply_nack(&mut job, &worker_id, AttemptOutcome::Cancelled, None, nack)?
            }
        };

        self.leases.release(job_id, &worker_id);
        drop(job);
        self.changed.notify_waiters();
        Ok(committed)
    }

    /// Reclaim every job whose lease expired. Returns how many were
    /// requeued or dead-lettered.
    pub async fn reclaim_expired(&self) -> usize {
        let mut reclaimed = 0;
        for lease in self.leases.take_expired() {
            let Ok(handle) = self.job(lease.job_id) else {
                continue;
            };
            let mut job = handle.lock().await;

            // Committed or re-leased while we waited for the job lock
            let abandoned = matches!(job.status, JobStatus::Claimed | JobStatus::Running)
                && job.worker_id.as_deref() == Some(lease.worker_id.as_str())
                && self.leases.holder(lease.job_id).is_none();
            if !abandoned {
                continue;
            }

            tracing::warn!(
                job_id = %lease.job_id,
                worker = %lease.worker_id,
                claimed_at = %lease.claimed_at,
                "Lease expired, reclaiming job"
            );
            match self
                .expire_attempt(&mut job, &lease.claimed, &lease.worker_id)
                .await
            {
                Ok(_) => reclaimed += 1,
                Err(e) => {
                    // Left as is; the stream redelivers the entry after the ack timeout
                    tracing::error!(job_id = %lease.job_id, error = %e, "Failed to reclaim job");
                }
            }
        }

        if reclaimed > 0 {
            self.changed.notify_waiters();
        }
        reclaimed
    }

    async fn expire_attempt(
        &self,
        job: &mut Job,
        claim: &ClaimedJob,
        previous_worker: &str,
    ) -> Result<CommitOutcome> {
        let nack = self.queue.nack(claim, NackReason::LeaseExpired).await?;
        let detail = format!("lease held by {previous_worker} expired");
        job.error = Some(detail.clone());
        let committed = Self::apply_nack(
            job,
            previous_worker,
            AttemptOutcome::LeaseExpired,
            Some(detail),
            nack,
        )?;
        if job.status.is_terminal() {
            self.save_record(job).await;
        }
        Ok(committed)
    }

    /// Take the job away from a worker that will not report back, without
    /// charging an attempt. The lease is released at once; the stream entry
    /// stays pending and is redelivered after the ack timeout.
    ///
    /// Returns false if the worker no longer held the job.
    pub async fn abandon(&self, job_id: Uuid, worker_id: &str) -> bool {
        if self.leases.held_by(job_id, worker_id).is_none() {
            return false;
        }
        self.leases.release(job_id, worker_id);

        // A commit stuck on the stream still holds the job lock
        if let Ok(handle) = self.job(job_id) {
            if let Ok(mut job) = handle.try_lock() {
                if matches!(job.status, JobStatus::Claimed | JobStatus::Running)
                    && job.worker_id.as_deref() == Some(worker_id)
                {
                    job.record_attempt(worker_id, AttemptOutcome::Cancelled, None);
                    job.worker_id = None;
                    if job.transition(JobStatus::Cancelled).is_ok() {
                        let _ = job.transition(JobStatus::Queued);
                    }
                }
            }
        }

        tracing::warn!(job_id = %job_id, worker = worker_id, "Job abandoned, lease released");
        self.changed.notify_waiters();
        true
    }

    /// Forget finished jobs completed more than `retention` ago and remove
    /// their records, models and own result files. Returns how many jobs
    /// were removed.
    pub async fn prune_finished(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        let expired = |job: &Job| {
            job.status.is_terminal() && job.completed_at.is_some_and(|at| at <= cutoff)
        };

        let mut victims: HashMap<Uuid, Job> = HashMap::new();
        let handles: Vec<(Uuid, Arc<Mutex<Job>>)> = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();
        for (id, handle) in handles {
            let job = handle.lock().await;
            if expired(&job) {
                victims.insert(id, job.clone());
            }
        }

        // Records left by earlier processes
        if let Some(records) = &self.records {
            match records.list().await {
                Ok(stored) => {
                    for job in stored.into_iter().filter(|job| expired(job)) {
                        victims.entry(job.id).or_insert(job);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to list job records"),
            }
        }

        if victims.is_empty() {
            return 0;
        }

        {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            for id in victims.keys() {
                jobs.remove(id);
            }
        }

        for job in victims.values() {
            let mut files = vec![job.model_path.clone()];
            // Cache hits point at another job's artifact
            let own_result = self.blobs.result_path(job.id);
            if job.result_path.as_ref() == Some(&own_result) {
                files.push(own_result);
            }
            for file in files {
                if let Err(e) = self.blobs.remove(&file).await {
                    tracing::warn!(job_id = %job.id, path = %file.display(), error = %e, "Failed to remove job file");
                }
            }
            if let Some(records) = &self.records {
                if let Err(e) = records.remove(job.id).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to remove job record");
                }
            }
        }

        tracing::info!(removed = victims.len(), ?retention, "Pruned finished jobs");
        victims.len()
    }

    /// Run [`prune_finished`](Self::prune_finished) every `interval` until
    /// `cancel` fires.
    pub async fn run_retention(
        &self,
        retention: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.prune_finished(retention).await;
                }
            }
        }
    }

    fn apply_nack(
        job: &mut Job,
        worker_id: &str,
        outcome: AttemptOutcome,
        error: Option<String>,
        nack: NackOutcome,
    ) -> Result<CommitOutcome> {
        job.worker_id = None;
        match nack {
            NackOutcome::Requeued { attempts, delay } => {
                job.attempts = attempts;
                job.record_attempt(worker_id, outcome, error);
                job.transition(JobStatus::Queued)?;
                tracing::info!(
                    job_id = %job.id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    outcome = %outcome,
                    "Job requeued"
                );
                Ok(CommitOutcome::Requeued { attempts, delay })
            }
            NackOutcome::DeadLettered { attempts } => {
                job.attempts = attempts;
                job.record_attempt(worker_id, outcome, error);
                job.transition(JobStatus::DeadLettered)?;
                tracing::error!(
                    job_id = %job.id,
                    attempts,
                    error = job.error.as_deref().unwrap_or_default(),
                    "Job dead-lettered"
                );
                Ok(CommitOutcome::DeadLettered { attempts })
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Cached artifact for `fingerprint` that still exists in the blob
    /// store. Entries whose artifact vanished are invalidated.
    async fn cached_result(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        let cache = self.cache.as_ref()?;
        let location = cache.get(fingerprint)?;
        match self.blobs.exists(&location).await {
            Ok(true) => Some(location),
            Ok(false) => {
                let _guard = self.fingerprint_locks.lock(fingerprint).await;
                if cache.invalidate(fingerprint) {
                    if let Err(e) = cache.persist().await {
                        tracing::warn!(fingerprint = %fingerprint, error = %e, "Failed to write cache index");
                    }
                }
                tracing::warn!(
                    fingerprint = %fingerprint,
                    location = %location.display(),
                    "Cached artifact missing, entry invalidated"
                );
                None
            }
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint, error = %e, "Cannot verify cached artifact");
                None
            }
        }
    }

    async fn save_record(&self, job: &Job) {
        let Some(records) = &self.records else {
            return;
        };
        if let Err(e) = records.save(job).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to store job record");
        }
    }

    async fn load_record(&self, job_id: Uuid) -> Option<Job> {
        let records = self.records.as_ref()?;
        match records.load(job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to read job record");
                None
            }
        }
    }

    /// Register a loaded record unless another task got there first.
    fn adopt(&self, job: Job) -> Arc<Mutex<Job>> {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(job.id)
            .or_insert_with(|| Arc::new(Mutex::new(job)))
            .clone()
    }

    async fn job_or_record(&self, job_id: Uuid) -> Result<Arc<Mutex<Job>>> {
        if let Ok(handle) = self.job(job_id) {
            return Ok(handle);
        }
        match self.load_record(job_id).await {
            Some(job) => Ok(self.adopt(job)),
            None => Err(SlicerError::JobNotFound(job_id)),
        }
    }

    fn insert_job(&self, job: Job) {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, Arc::new(Mutex::new(job)));
    }

    fn job(&self, job_id: Uuid) -> Result<Arc<Mutex<Job>>> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned()
            .ok_or(SlicerError::JobNotFound(job_id))
    }

    /// Job record for a claimed message: the live record, the stored record
    /// of a finished job, or one rebuilt from the message if this process
    /// never saw the submission.
    async fn job_entry(&self, message: &QueueMessage) -> Arc<Mutex<Job>> {
        if let Ok(handle) = self.job_or_record(message.job_id).await {
            return handle;
        }
        tracing::debug!(job_id = %message.job_id, "Job record rebuilt from queue message");
        self.adopt(Job::from_message(message))
    }
}

#[async_trait]
impl SubmissionApi for Coordinator {
    async fn submit(&self, model: ModelRef, params: SliceParams) -> Result<Uuid> {
        Coordinator::submit(self, model, params).await
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Job> {
        Coordinator::get_status(self, job_id).await
    }

    async fn get_result(&self, job_id: Uuid) -> Result<JobResult> {
        Coordinator::get_result(self, job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, CacheConfig, QueueConfig, StorageConfig};
    use crate::queue::MemoryStream;
    use crate::storage::LocalBlobStore;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        stream: Arc<MemoryStream>,
        blobs: Arc<LocalBlobStore>,
        cache: Arc<ResultCache>,
        coordinator: Coordinator,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(LocalBlobStore::new(StorageConfig {
            models_path: dir.path().join("models"),
            results_path: dir.path().join("results"),
            ..Default::default()
        }));
        blobs.init().await.unwrap();
        let cache = Arc::new(ResultCache::new(CacheConfig::default()));
        let stream = Arc::new(MemoryStream::new("test"));
        let queue = JobQueueClient::new(
            stream.clone(),
            QueueConfig {
                max_retries: 2,
                retry_delay: Duration::ZERO,
                backoff: BackoffConfig {
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                    max_attempts: 2,
                },
                ..Default::default()
            },
        );
        let coordinator = Coordinator::new(queue, blobs.clone(), Some(cache.clone()))
            .with_records(JobRecordStore::new(dir.path().join("results").join("jobs")));
        Fixture {
            dir,
            stream,
            blobs,
            cache,
            coordinator,
        }
    }

    fn model(data: &[u8]) -> ModelRef {
        ModelRef::Bytes {
            name: "cube.stl".to_string(),
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn submit_queues_job() {
        let fx = fixture().await;
        let id = fx
            .coordinator
            .submit(model(b"solid a"), SliceParams::default())
            .await
            .unwrap();

        let job = fx.coordinator.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(
            fx.coordinator.get_result(id).await.unwrap(),
            JobResult::NotReady(JobStatus::Queued)
        );
    }

    #[tokio::test]
    async fn submit_rejects_unsupported_format() {
        let fx = fixture().await;
        let err = fx
            .coordinator
            .submit(
                ModelRef::Bytes {
                    name: "notes.txt".to_string(),
                    data: b"hello".to_vec(),
                },
                SliceParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SlicerError::InvalidModel(_)));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let fx = fixture().await;
        assert!(matches!(
            fx.coordinator.get_status(Uuid::new_v4()).await,
            Err(SlicerError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn claim_run_commit_success() {
        let fx = fixture().await;
        let id = fx
            .coordinator
            .submit(model(b"solid a"), SliceParams::default())
            .await
            .unwrap();

        let assignments = fx.coordinator.claim_batch("worker-1", 5).await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].attempt, 1);
        fx.coordinator.mark_running(id, "worker-1").await.unwrap();
        fx.coordinator.heartbeat(id, "worker-1").await.unwrap();

        let location = fx.blobs.store_result(id, b"G1").await.unwrap();
        let committed = fx
            .coordinator
            .commit(WorkerOutcome {
                job_id: id,
                worker_id: "worker-1".to_string(),
                result: AttemptResult::Succeeded {
                    location: location.clone(),
                    size: 2,
                },
            })
            .await
            .unwrap();

        assert_eq!(committed, CommitOutcome::Succeeded);
        let job = fx.coordinator.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 1);
        assert_eq!(fx.cache.get(&job.fingerprint), Some(location));
        assert_eq!(fx.coordinator.live_leases(), 0);
    }

    #[tokio::test]
    async fn failures_dead_letter_at_budget() {
        let fx = fixture().await;
        let id = fx
            .coordinator
            .submit(model(b"solid a"), SliceParams::default())
            .await
            .unwrap();

        for expected in 1..=2u32 {
            let assignment = fx
                .coordinator
                .claim_batch("worker-1", 1)
                .await
                .unwrap()
                .remove(0);
            assert_eq!(assignment.attempt, expected);
            fx.coordinator.mark_running(id, "worker-1").await.unwrap();
            fx.coordinator
                .commit(WorkerOutcome {
                    job_id: id,
                    worker_id: "worker-1".to_string(),
                    result: AttemptResult::Failed(format!("failure {expected}")),
                })
                .await
                .unwrap();
        }

        let job = fx.coordinator.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::DeadLettered);
        assert_eq!(job.attempts, 2);
        match fx.coordinator.get_result(id).await.unwrap() {
            JobResult::Failed(report) => {
                assert_eq!(report.attempts, 2);
                assert_eq!(report.last_error, "failure 2");
                assert_eq!(report.history.len(), 2);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(fx.coordinator.dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn commit_without_lease_is_discarded() {
        let fx = fixture().await;
        let id = fx
            .coordinator
            .submit(model(b"solid a"), SliceParams::default())
            .await
            .unwrap();
        fx.coordinator.claim_batch("worker-1", 1).await.unwrap();

        let committed = fx
            .coordinator
            .commit(WorkerOutcome {
                job_id: id,
                worker_id: "worker-2".to_string(),
                result: AttemptResult::Failed("not mine".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(committed, CommitOutcome::Discarded);
        assert_eq!(
            fx.coordinator.get_status(id).await.unwrap().status,
            JobStatus::Claimed
        );
    }

    #[tokio::test]
    async fn cancelled_attempt_keeps_budget() {
        let fx = fixture().await;
        let id = fx
            .coordinator
            .submit(model(b"solid a"), SliceParams::default())
            .await
            .unwrap();
        fx.coordinator.claim_batch("worker-1", 1).await.unwrap();

        let committed = fx
            .coordinator
            .commit(WorkerOutcome {
                job_id: id,
                worker_id: "worker-1".to_string(),
                result: AttemptResult::Cancelled,
            })
            .await
            .unwrap();

        assert_eq!(
            committed,
            CommitOutcome::Requeued {
                attempts: 0,
                delay: Duration::ZERO
            }
        );
        let job = fx.coordinator.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.history[0].outcome, AttemptOutcome::Cancelled);
    }

    #[tokio::test]
    async fn wait_returns_on_timeout_with_current_state() {
        let fx = fixture().await;
        let id = fx
            .coordinator
            .submit(model(b"solid a"), SliceParams::default())
            .await
            .unwrap();
        let job = fx
            .coordinator
            .wait(id, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn failed_enqueue_removes_uploaded_model() {
        let fx = fixture().await;
        fx.stream.set_available(false);

        let err = fx
            .coordinator
            .submit(model(b"solid a"), SliceParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SlicerError::QueueUnavailable { .. }));

        let models = std::fs::read_dir(fx.dir.path().join("models")).unwrap();
        assert_eq!(models.count(), 0);
        assert!(fx.coordinator.list().await.is_empty());
    }

    #[tokio::test]
    async fn abandon_releases_lease_without_charging() {
        let fx = fixture().await;
        let id = fx
            .coordinator
            .submit(model(b"solid a"), SliceParams::default())
            .await
            .unwrap();
        fx.coordinator.claim_batch("worker-1", 1).await.unwrap();
        fx.coordinator.mark_running(id, "worker-1").await.unwrap();

        assert!(!fx.coordinator.abandon(id, "worker-2").await);
        assert!(fx.coordinator.abandon(id, "worker-1").await);

        let job = fx.coordinator.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.history[0].outcome, AttemptOutcome::Cancelled);
        assert_eq!(fx.coordinator.live_leases(), 0);

        // A late report from the abandoned worker is dropped
        let committed = fx
            .coordinator
            .commit(WorkerOutcome {
                job_id: id,
                worker_id: "worker-1".to_string(),
                result: AttemptResult::Cancelled,
            })
            .await
            .unwrap();
        assert_eq!(committed, CommitOutcome::Discarded);
    }

    #[tokio::test]
    async fn finished_jobs_are_pruned_with_their_files() {
        let fx = fixture().await;
        let id = fx
            .coordinator
            .submit(model(b"solid a"), SliceParams::default())
            .await
            .unwrap();
        let live = fx
            .coordinator
            .submit(model(b"solid b"), SliceParams::default())
            .await
            .unwrap();
        fx.coordinator.claim_batch("worker-1", 1).await.unwrap();
        let location = fx.blobs.store_result(id, b"G1").await.unwrap();
        fx.coordinator
            .commit(WorkerOutcome {
                job_id: id,
                worker_id: "worker-1".to_string(),
                result: AttemptResult::Succeeded {
                    location: location.clone(),
                    size: 2,
                },
            })
            .await
            .unwrap();
        let model_path = fx.coordinator.get_status(id).await.unwrap().model_path;
        let record = fx
            .dir
            .path()
            .join("results")
            .join("jobs")
            .join(format!("{id}.json"));
        assert!(record.exists());

        // Not old enough yet
        assert_eq!(fx.coordinator.prune_finished(Duration::from_secs(3600)).await, 0);

        assert_eq!(fx.coordinator.prune_finished(Duration::ZERO).await, 1);
        assert!(matches!(
            fx.coordinator.get_status(id).await,
            Err(SlicerError::JobNotFound(_))
        ));
        assert!(!location.exists());
        assert!(!model_path.exists());
        assert!(!record.exists());

        // Unfinished jobs stay
        assert_eq!(
            fx.coordinator.get_status(live).await.unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn finished_job_answers_from_record_after_restart() {
        let fx = fixture().await;
        let id = fx
            .coordinator
            .submit(model(b"solid a"), SliceParams::default())
            .await
            .unwrap();
        fx.coordinator.claim_batch("worker-1", 1).await.unwrap();
        for _ in 0..2 {
            fx.coordinator.mark_running(id, "worker-1").await.ok();
            fx.coordinator
                .commit(WorkerOutcome {
                    job_id: id,
                    worker_id: "worker-1".to_string(),
                    result: AttemptResult::Failed("bad mesh".to_string()),
                })
                .await
                .unwrap();
            fx.coordinator.claim_batch("worker-1", 1).await.unwrap();
        }

        let queue = JobQueueClient::new(fx.stream.clone(), QueueConfig::default());
        let restarted = Coordinator::new(queue, fx.blobs.clone(), None)
            .with_records(JobRecordStore::new(fx.dir.path().join("results").join("jobs")));

        match restarted.get_result(id).await.unwrap() {
            JobResult::Failed(report) => {
                assert_eq!(report.attempts, 2);
                assert_eq!(report.last_error, "bad mesh");
            }
            other => panic!("expected dead-letter report, got {other:?}"),
        }
    }
}
