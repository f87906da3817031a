//! Test harness for engine integration tests.
//!
//! Provides a scripted slicer, an engine wired to an in-process stream and a
//! temporary blob store, and polling helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use slicer_queue::config::{BackoffConfig, EngineConfig};
use slicer_queue::queue::MemoryStream;
use slicer_queue::scheduler::{Job, SliceParams};
use slicer_queue::storage::{LocalBlobStore, ModelRef};
use slicer_queue::worker::{ExecutionResult, SliceRequest, SlicerExecutor};
use slicer_queue::{Engine, Result};

/// What the scripted slicer does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(String),
    /// Succeed after a delay, or report `Cancelled` if cancelled first
    Delay(Duration),
    /// Block until cancelled or the request timeout elapses
    Hang,
    /// Ignore cancellation and timeout, then succeed after the delay
    Stubborn(Duration),
}

/// Slicer double that plays a script of steps, one per call, then succeeds.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Most calls ever in flight at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Succeed)
    }

    async fn write_output(request: &SliceRequest) -> Result<ExecutionResult> {
        tokio::fs::write(&request.output, format!("; sliced {}\nG28\n", request.job_id)).await?;
        Ok(ExecutionResult::Completed {
            stderr: String::new(),
        })
    }
}

#[async_trait]
impl SlicerExecutor for ScriptedExecutor {
    async fn run(
        &self,
        request: &SliceRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let result = match self.next_step() {
            Step::Succeed => Self::write_output(request).await,
            Step::Fail(stderr) => Ok(ExecutionResult::Failed {
                exit_code: Some(1),
                stderr,
            }),
            Step::Delay(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Self::write_output(request).await,
                    _ = cancel.cancelled() => Ok(ExecutionResult::Cancelled),
                }
            }
            Step::Hang => {
                tokio::select! {
                    _ = cancel.cancelled() => Ok(ExecutionResult::Cancelled),
                    _ = tokio::time::sleep(request.timeout) => Ok(ExecutionResult::TimedOut {
                        after: request.timeout,
                        stderr: String::new(),
                    }),
                }
            }
            Step::Stubborn(delay) => {
                let _guard = RunningGuard(&self.running);
                tokio::time::sleep(delay).await;
                return Self::write_output(request).await;
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Keeps `running` accurate when a run future is dropped mid-flight.
struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Engine configuration with short intervals for fast tests.
pub fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.queue.stream_name = "test:jobs".to_string();
    config.queue.retry_delay = Duration::from_millis(50);
    config.queue.ack_timeout = Duration::from_secs(2);
    config.queue.backoff = BackoffConfig {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_attempts: 3,
    };
    config.workers.count = 2;
    config.workers.max_concurrent = 2;
    config.workers.holding_capacity = 2;
    config.workers.heartbeat_interval = Duration::from_millis(100);
    config.workers.worker_timeout = Duration::from_secs(10);
    config.workers.claim_poll_interval = Duration::from_millis(10);
    config.storage.models_path = dir.join("models");
    config.storage.results_path = dir.join("results");
    config.storage.backoff = config.queue.backoff.clone();
    config.shutdown.timeout = Duration::from_secs(1);
    config.shutdown.kill_grace = Duration::from_millis(300);
    config
}

/// Handle to a running engine backed by an in-process stream
pub struct TestEngine {
    pub engine: Engine,
    pub stream: Arc<MemoryStream>,
    pub blobs: Arc<LocalBlobStore>,
    pub executor: Arc<ScriptedExecutor>,
    pub dir: TempDir,
}

impl TestEngine {
    pub async fn start(steps: Vec<Step>) -> Self {
        Self::start_with(steps, |_| {}).await
    }

    /// Start an engine after letting the caller adjust the test config
    pub async fn start_with(steps: Vec<Step>, tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let t = Self::build_with(steps, tweak).await;
        t.engine.start();
        t
    }

    /// Build the engine without starting its workers
    pub async fn build_with(steps: Vec<Step>, tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);

        let stream = Arc::new(MemoryStream::new(config.queue.stream_name.clone()));
        let blobs = Arc::new(LocalBlobStore::new(config.storage.clone()));
        blobs.init().await.unwrap();
        let executor = Arc::new(ScriptedExecutor::new(steps));

        let engine = Engine::new(config, stream.clone(), blobs.clone(), executor.clone())
            .await
            .unwrap();

        Self {
            engine,
            stream,
            blobs,
            executor,
            dir,
        }
    }

    /// Submit a model whose content is derived from `tag`.
    pub async fn submit(&self, tag: &str) -> Uuid {
        self.engine
            .submission()
            .submit(model(tag), SliceParams::default())
            .await
            .unwrap()
    }

    /// Wait for the job to reach a terminal state
    pub async fn wait(&self, job_id: Uuid) -> Job {
        self.engine
            .coordinator()
            .wait(job_id, Duration::from_secs(10))
            .await
            .unwrap()
    }
}

pub fn model(tag: &str) -> ModelRef {
    ModelRef::Bytes {
        name: format!("{tag}.stl"),
        data: format!("solid {tag}\nendsolid {tag}\n").into_bytes(),
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
