use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, SlicerError};
use crate::scheduler::job::SliceParams;

/// Stderr captured per run is capped at 10 MiB.
const MAX_STDERR_BYTES: u64 = 10 * 1024 * 1024;

const STDERR_DRAIN: Duration = Duration::from_secs(2);

/// One invocation of the slicer.
#[derive(Debug, Clone)]
pub struct SliceRequest {
    pub job_id: Uuid,
    pub input: PathBuf,
    pub output: PathBuf,
    pub params: SliceParams,
    pub timeout: Duration,
}

/// How a slicer run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Completed { stderr: String },
    Failed { exit_code: Option<i32>, stderr: String },
    /// Killed at the deadline; `stderr` is whatever it wrote until then
    TimedOut { after: Duration, stderr: String },
    Cancelled,
}

impl ExecutionResult {
    /// The job-level error for a run that did not complete, `None` for
    /// completed or cancelled runs.
    pub fn failure(&self) -> Option<SlicerError> {
        match self {
            ExecutionResult::Failed { exit_code, stderr } => Some(SlicerError::ExecutorFailure {
                exit_code: *exit_code,
                stderr: stderr.clone(),
            }),
            ExecutionResult::TimedOut { after, stderr } => Some(SlicerError::ExecutorTimeout {
                after: *after,
                stderr: if stderr.is_empty() {
                    "no output".to_string()
                } else {
                    stderr.clone()
                },
            }),
            ExecutionResult::Completed { .. } | ExecutionResult::Cancelled => None,
        }
    }
}

/// Runs the external slicer against a stored model.
///
/// Implementations must stop the slicer when `cancel` fires or the request
/// timeout elapses. `Err` is reserved for failures to start it at all.
#[async_trait]
pub trait SlicerExecutor: Send + Sync + 'static {
    async fn run(&self, request: &SliceRequest, cancel: CancellationToken)
        -> Result<ExecutionResult>;
}

/// Executes the slicer binary as a child process.
///
/// The child is killed on timeout, on cancellation, and if the run future is
/// dropped.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    binary: PathBuf,
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessExecutor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// `slice --input <in> --output <out>` followed by the profile flags and
    /// a single `--set k=v,k=v` for overrides.
    pub fn build_args(request: &SliceRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "slice".into(),
            "--input".into(),
            request.input.clone().into_os_string(),
            "--output".into(),
            request.output.clone().into_os_string(),
        ];

        let params = &request.params;
        if let Some(plate) = params.plate {
            args.push("--plate".into());
            args.push(plate.to_string().into());
        }
        for (flag, value) in [
            ("--printer", &params.printer),
            ("--filament", &params.filament),
            ("--process", &params.process),
        ] {
            if let Some(value) = value {
                args.push(flag.into());
                args.push(value.into());
            }
        }
        if !params.overrides.is_empty() {
            let set = params
                .overrides
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            args.push("--set".into());
            args.push(set.into());
        }
        args
    }
}

#[async_trait]
impl SlicerExecutor for ProcessExecutor {
    async fn run(
        &self,
        request: &SliceRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        tracing::info!(
            job_id = %request.job_id,
            binary = %self.binary.display(),
            input = %request.input.display(),
            "Executing slicer"
        );

        if let Some(parent) = request.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut child = Command::new(&self.binary)
            .args(Self::build_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                tracing::error!(job_id = %request.job_id, error = %e, "Failed to start slicer");
                SlicerError::ExecutorFailure {
                    exit_code: None,
                    stderr: format!("failed to start {}: {e}", self.binary.display()),
                }
            })?;

        let stderr_task = tokio::spawn(read_capped(child.stderr.take()));

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(request.timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        let result = match waited {
            Waited::Exited(status) => {
                let status = status?;
                let stderr = collect_stderr(stderr_task).await;
                if status.success() {
                    ExecutionResult::Completed { stderr }
                } else {
                    let exit_code = status.code();
                    ExecutionResult::Failed {
                        exit_code,
                        stderr: if stderr.is_empty() {
                            format!("Exit code: {:?}", exit_code)
                        } else {
                            stderr
                        },
                    }
                }
            }
            Waited::TimedOut => {
                kill(&mut child, request.job_id).await;
                // The pipe closes with the process
                ExecutionResult::TimedOut {
                    after: request.timeout,
                    stderr: collect_stderr(stderr_task).await,
                }
            }
            Waited::Cancelled => {
                kill(&mut child, request.job_id).await;
                ExecutionResult::Cancelled
            }
        };

        match &result {
            ExecutionResult::Completed { .. } => {
                tracing::info!(job_id = %request.job_id, "Slicer completed");
            }
            ExecutionResult::Failed { exit_code, .. } => {
                tracing::warn!(job_id = %request.job_id, exit_code = ?exit_code, "Slicer failed");
            }
            ExecutionResult::TimedOut { after, .. } => {
                tracing::warn!(job_id = %request.job_id, timeout = ?after, "Slicer timed out, killed");
            }
            ExecutionResult::Cancelled => {
                tracing::info!(job_id = %request.job_id, "Slicer cancelled, killed");
            }
        }
        Ok(result)
    }
}

async fn kill(child: &mut tokio::process::Child, job_id: Uuid) {
    if let Err(e) = child.kill().await {
        tracing::warn!(job_id = %job_id, error = %e, "Failed to kill slicer process");
    }
}

/// Stderr reader output. Grandchildren that inherited the pipe can keep it
/// open past the slicer's exit, so the wait is bounded.
async fn collect_stderr(task: tokio::task::JoinHandle<Vec<u8>>) -> String {
    let bytes = match tokio::time::timeout(STDERR_DRAIN, task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => Vec::new(),
    };
    String::from_utf8_lossy(&bytes).trim().to_string()
}

async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_STDERR_BYTES).read_to_end(&mut buf).await;
    }
    buf
}
