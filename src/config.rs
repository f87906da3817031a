use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SlicerError};

/// Exponential backoff for transient infrastructure errors.
///
/// Attempt `n` (0-based) waits `base_delay * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total tries, including the first one
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Durable stream settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub stream_name: String,
    pub consumer_group: String,
    /// Attempts a job may consume before it is dead-lettered
    pub max_retries: u32,
    /// Visibility delay applied to a job requeued after a failure
    pub retry_delay: Duration,
    pub batch_size: usize,
    /// A pending entry idle for longer than this may be redelivered
    pub ack_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream_name: "slicer:jobs".to_string(),
            consumer_group: "slicer-workers".to_string(),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            batch_size: 10,
            ack_timeout: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of claim loops, each a named consumer in the group
    pub count: usize,
    pub max_concurrent: usize,
    /// Claimed jobs allowed to wait for a free execution slot
    pub holding_capacity: usize,
    pub heartbeat_interval: Duration,
    pub worker_timeout: Duration,
    pub slicer_binary: PathBuf,
    pub consumer_prefix: String,
    pub claim_poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 3,
            max_concurrent: 5,
            holding_capacity: 10,
            heartbeat_interval: Duration::from_secs(30),
            worker_timeout: Duration::from_secs(30 * 60),
            slicer_binary: PathBuf::from("./bin/slicer-headless"),
            consumer_prefix: "worker".to_string(),
            claim_poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Total artifact bytes the cache may index
    pub max_size: u64,
    pub ttl: Duration,
    pub clean_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 10 * 1024 * 1024 * 1024,
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            clean_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub models_path: PathBuf,
    pub results_path: PathBuf,
    pub max_file_size: u64,
    pub backoff: BackoffConfig,
    /// Remove finished jobs, their records and their files after `retention`
    pub cleanup_enabled: bool,
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            models_path: PathBuf::from("./uploads/models"),
            results_path: PathBuf::from("./uploads/results"),
            max_file_size: 100 * 1024 * 1024,
            backoff: BackoffConfig::default(),
            cleanup_enabled: true,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl StorageConfig {
    /// Directory holding one record per finished job.
    pub fn records_path(&self) -> PathBuf {
        self.results_path.join("jobs")
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Upper bound for the whole shutdown, drain and forced phase together
    pub timeout: Duration,
    /// Portion of `timeout` reserved for killing and requeueing what is
    /// still running after the drain phase
    pub kill_grace: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        self.timeout.saturating_sub(self.kill_grace)
    }
}

/// Complete engine configuration, passed by value to each component.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    pub shutdown: ShutdownConfig,
}

impl EngineConfig {
    /// Check every field and report all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.queue.stream_name.trim().is_empty() {
            errors.push("queue.stream_name must not be empty");
        }
        if self.queue.consumer_group.trim().is_empty() {
            errors.push("queue.consumer_group must not be empty");
        }
        if self.queue.max_retries == 0 {
            errors.push("queue.max_retries must be greater than 0");
        }
        if self.queue.batch_size == 0 {
            errors.push("queue.batch_size must be greater than 0");
        }
        if self.queue.ack_timeout.is_zero() {
            errors.push("queue.ack_timeout must be greater than 0");
        }
        if self.queue.backoff.max_attempts == 0 {
            errors.push("queue.backoff.max_attempts must be greater than 0");
        }
        if self.workers.count == 0 {
            errors.push("workers.count must be greater than 0");
        }
        if self.workers.max_concurrent == 0 {
            errors.push("workers.max_concurrent must be greater than 0");
        }
        if self.workers.heartbeat_interval.is_zero() {
            errors.push("workers.heartbeat_interval must be greater than 0");
        }
        if self.workers.heartbeat_interval >= self.queue.ack_timeout {
            errors.push("workers.heartbeat_interval must be shorter than queue.ack_timeout");
        }
        if self.workers.worker_timeout.is_zero() {
            errors.push("workers.worker_timeout must be greater than 0");
        }
        if self.workers.slicer_binary.as_os_str().is_empty() {
            errors.push("workers.slicer_binary must not be empty");
        }
        if self.cache.enabled && self.cache.clean_interval.is_zero() {
            errors.push("cache.clean_interval must be greater than 0");
        }
        if self.storage.models_path.as_os_str().is_empty() {
            errors.push("storage.models_path must not be empty");
        }
        if self.storage.results_path.as_os_str().is_empty() {
            errors.push("storage.results_path must not be empty");
        }
        if self.storage.max_file_size == 0 {
            errors.push("storage.max_file_size must be greater than 0");
        }
        if self.storage.cleanup_enabled && self.storage.cleanup_interval.is_zero() {
            errors.push("storage.cleanup_interval must be greater than 0");
        }
        if self.shutdown.kill_grace >= self.shutdown.timeout {
            errors.push("shutdown.kill_grace must be shorter than shutdown.timeout");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SlicerError::InvalidConfig(errors.join("; ")))
        }
    }
}
