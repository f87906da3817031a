use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use slicer_queue::config::{
    BackoffConfig, CacheConfig, EngineConfig, QueueConfig, ShutdownConfig, StorageConfig,
    WorkerConfig,
};
use slicer_queue::queue::{MemoryStream, StreamBackend};
use slicer_queue::scheduler::{Job, JobStatus, SliceParams};
use slicer_queue::shutdown::install_shutdown_handler;
use slicer_queue::storage::{LocalBlobStore, ModelRef};
use slicer_queue::worker::ProcessExecutor;
use slicer_queue::Engine;

#[derive(Parser, Debug)]
#[command(name = "slicer-queue")]
#[command(version)]
#[command(about = "Durable job queue and worker pool for 3D-model slicing")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the engine, slice the given models and print their results
    Run(RunArgs),
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Model files to submit (.stl or .3mf)
    models: Vec<PathBuf>,

    /// Keep serving after the submitted models finish, until SIGTERM/SIGINT
    #[arg(long)]
    serve: bool,

    /// How long to wait for each submitted model
    #[arg(long, default_value = "30m", value_parser = parse_duration)]
    wait_timeout: Duration,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Log format
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    #[command(flatten)]
    slicing: SlicingArgs,

    #[command(flatten)]
    queue: QueueArgs,

    #[command(flatten)]
    workers: WorkerArgs,

    #[command(flatten)]
    cache: CacheArgs,

    #[command(flatten)]
    storage: StorageArgs,

    /// Total shutdown budget: drain plus forced cancellation
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    shutdown_timeout: Duration,

    /// Part of the shutdown budget reserved for cancelling running jobs
    #[arg(long, env = "SHUTDOWN_KILL_GRACE", default_value = "2s", value_parser = parse_duration)]
    kill_grace: Duration,
}

#[derive(Parser, Debug)]
struct SlicingArgs {
    /// 1-based plate index for multi-plate .3mf projects
    #[arg(long)]
    plate: Option<u32>,

    #[arg(long)]
    printer: Option<String>,

    #[arg(long)]
    filament: Option<String>,

    #[arg(long)]
    process: Option<String>,

    /// Slicer setting override, repeatable (format: "key=value")
    #[arg(long = "set", value_parser = parse_override)]
    overrides: Vec<(String, String)>,
}

#[derive(Parser, Debug)]
struct QueueArgs {
    /// Redis URL (needs the `redis` feature); without it jobs live in an
    /// in-process stream
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, env = "QUEUE_STREAM", default_value = "slicer:jobs")]
    stream: String,

    #[arg(long, env = "CONSUMER_GROUP", default_value = "slicer-workers")]
    consumer_group: String,

    #[arg(long, env = "MAX_RETRIES", default_value = "3")]
    max_retries: u32,

    #[arg(long, env = "RETRY_DELAY", default_value = "5s", value_parser = parse_duration)]
    retry_delay: Duration,

    #[arg(long, env = "BATCH_SIZE", default_value = "10")]
    batch_size: usize,

    #[arg(long, env = "ACK_TIMEOUT", default_value = "60s", value_parser = parse_duration)]
    ack_timeout: Duration,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    #[arg(long, env = "WORKER_COUNT", default_value = "3")]
    worker_count: usize,

    #[arg(long, env = "MAX_CONCURRENT", default_value = "5")]
    max_concurrent: usize,

    /// Claimed jobs allowed to wait for a free execution slot
    #[arg(long, env = "HOLDING_CAPACITY", default_value = "10")]
    holding_capacity: usize,

    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    heartbeat_interval: Duration,

    #[arg(long, env = "WORKER_TIMEOUT", default_value = "30m", value_parser = parse_duration)]
    worker_timeout: Duration,

    #[arg(long, env = "SLICER_BINARY", default_value = "./bin/slicer-headless")]
    slicer_binary: PathBuf,
}

#[derive(Parser, Debug)]
struct CacheArgs {
    #[arg(long, env = "CACHE_ENABLED", default_value = "true", action = clap::ArgAction::Set)]
    cache_enabled: bool,

    /// Bytes
    #[arg(long, env = "CACHE_MAX_SIZE", default_value = "10737418240")]
    cache_max_size: u64,

    #[arg(long, env = "CACHE_TTL", default_value = "168h", value_parser = parse_duration)]
    cache_ttl: Duration,

    #[arg(long, env = "CACHE_CLEAN_INTERVAL", default_value = "1h", value_parser = parse_duration)]
    cache_clean_interval: Duration,
}

#[derive(Parser, Debug)]
struct StorageArgs {
    #[arg(long, env = "MODELS_PATH", default_value = "./uploads/models")]
    models_path: PathBuf,

    #[arg(long, env = "RESULTS_PATH", default_value = "./uploads/results")]
    results_path: PathBuf,

    /// Bytes
    #[arg(long, env = "MAX_FILE_SIZE", default_value = "104857600")]
    max_file_size: u64,

    /// Remove finished jobs and their files once past the retention period
    #[arg(long, env = "CLEANUP_ENABLED", default_value = "true", action = clap::ArgAction::Set)]
    cleanup_enabled: bool,

    #[arg(long, env = "RETENTION", default_value = "30d", value_parser = parse_duration)]
    retention: Duration,

    #[arg(long, env = "CLEANUP_INTERVAL", default_value = "1h", value_parser = parse_duration)]
    cleanup_interval: Duration,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

// =============================================================================
// Argument Parsing
// =============================================================================

/// Durations as `500ms`, `5s`, `30m`, `1h`, `7d`; a bare number is seconds.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let n: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{value}'"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "" | "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 60 * 60)),
        "d" => Ok(Duration::from_secs(n * 24 * 60 * 60)),
        _ => Err(format!("invalid duration unit '{unit}' in '{value}'")),
    }
}

fn parse_override(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => Err(format!("invalid override '{value}', expected key=value")),
    }
}

impl RunArgs {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            queue: QueueConfig {
                stream_name: self.queue.stream.clone(),
                consumer_group: self.queue.consumer_group.clone(),
                max_retries: self.queue.max_retries,
                retry_delay: self.queue.retry_delay,
                batch_size: self.queue.batch_size,
                ack_timeout: self.queue.ack_timeout,
                backoff: BackoffConfig::default(),
            },
            workers: WorkerConfig {
                count: self.workers.worker_count,
                max_concurrent: self.workers.max_concurrent,
                holding_capacity: self.workers.holding_capacity,
                heartbeat_interval: self.workers.heartbeat_interval,
                worker_timeout: self.workers.worker_timeout,
                slicer_binary: self.workers.slicer_binary.clone(),
                ..WorkerConfig::default()
            },
            cache: CacheConfig {
                enabled: self.cache.cache_enabled,
                max_size: self.cache.cache_max_size,
                ttl: self.cache.cache_ttl,
                clean_interval: self.cache.cache_clean_interval,
            },
            storage: StorageConfig {
                models_path: self.storage.models_path.clone(),
                results_path: self.storage.results_path.clone(),
                max_file_size: self.storage.max_file_size,
                backoff: BackoffConfig::default(),
                cleanup_enabled: self.storage.cleanup_enabled,
                retention: self.storage.retention,
                cleanup_interval: self.storage.cleanup_interval,
            },
            shutdown: ShutdownConfig {
                timeout: self.shutdown_timeout,
                kill_grace: self.kill_grace,
            },
        }
    }

    fn params(&self) -> SliceParams {
        let s = &self.slicing;
        s.overrides.iter().fold(
            SliceParams {
                plate: s.plate,
                printer: s.printer.clone(),
                filament: s.filament.clone(),
                process: s.process.clone(),
                ..SliceParams::default()
            },
            |params, (k, v)| params.with_override(k, v),
        )
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobOutput {
    job_id: String,
    model: String,
    status: String,
    attempts: u32,
    result: Option<String>,
    error: Option<String>,
}

impl JobOutput {
    fn new(model: &std::path::Path, job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            model: model.display().to_string(),
            status: job.status.to_string(),
            attempts: job.attempts,
            result: job.result_path.as_ref().map(|p| p.display().to_string()),
            error: job.error.clone(),
        }
    }
}

#[derive(Serialize)]
struct RunOutput {
    jobs: Vec<JobOutput>,
    succeeded: usize,
    failed: usize,
}

fn print_results(jobs: Vec<JobOutput>, format: &OutputFormat) -> anyhow::Result<()> {
    let succeeded = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Succeeded.to_string())
        .count();
    let failed = jobs.len() - succeeded;

    match format {
        OutputFormat::Json => {
            let output = RunOutput {
                jobs,
                succeeded,
                failed,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs submitted.");
                return Ok(());
            }
            println!(
                "{:<38} {:<14} {:<9} RESULT / ERROR",
                "JOB ID", "STATUS", "ATTEMPTS"
            );
            println!("{}", "-".repeat(90));
            for job in &jobs {
                let detail = job
                    .result
                    .as_deref()
                    .or(job.error.as_deref())
                    .unwrap_or("-");
                println!(
                    "{:<38} {:<14} {:<9} {}",
                    job.job_id, job.status, job.attempts, detail
                );
            }
            println!();
            println!("{} succeeded, {} not succeeded", succeeded, failed);
        }
    }
    Ok(())
}

// =============================================================================
// Run Implementation
// =============================================================================

fn init_logging(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn open_backend(args: &RunArgs) -> anyhow::Result<Arc<dyn StreamBackend>> {
    if let Some(url) = &args.queue.redis_url {
        return open_redis(url, args).await;
    }

    tracing::info!(stream = %args.queue.stream, "Using in-process stream");
    Ok(Arc::new(MemoryStream::new(args.queue.stream.clone())))
}

#[cfg(feature = "redis")]
async fn open_redis(url: &str, args: &RunArgs) -> anyhow::Result<Arc<dyn StreamBackend>> {
    let stream = slicer_queue::queue::redis::RedisStream::new(
        url,
        &args.queue.stream,
        &args.queue.consumer_group,
    )?;
    stream
        .ensure_group()
        .await
        .context("failed to create consumer group")?;
    tracing::info!(stream = %args.queue.stream, group = %args.queue.consumer_group, "Using Redis Streams backend");
    Ok(Arc::new(stream))
}

#[cfg(not(feature = "redis"))]
async fn open_redis(_url: &str, _args: &RunArgs) -> anyhow::Result<Arc<dyn StreamBackend>> {
    anyhow::bail!("--redis-url requires a build with the `redis` feature")
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_logging(&args.log_format);

    let config = args.engine_config();
    let blobs = Arc::new(LocalBlobStore::new(config.storage.clone()));
    blobs
        .init()
        .await
        .context("failed to create storage directories")?;
    let executor = Arc::new(ProcessExecutor::new(config.workers.slicer_binary.clone()));
    let backend = open_backend(&args).await?;

    let engine = Engine::new(config, backend, blobs, executor).await?;
    let shutdown = install_shutdown_handler();
    engine.start();

    let submission = engine.submission();
    let coordinator = engine.coordinator();
    let params = args.params();

    let mut submitted = Vec::new();
    for model in &args.models {
        let name = model
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let data = tokio::fs::read(model)
            .await
            .with_context(|| format!("failed to read {}", model.display()))?;
        match submission
            .submit(ModelRef::Bytes { name, data }, params.clone())
            .await
        {
            Ok(job_id) => submitted.push((model.clone(), job_id)),
            Err(e) => tracing::error!(model = %model.display(), error = %e, "Submission rejected"),
        }
    }

    let mut results = Vec::new();
    for (model, job_id) in &submitted {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = coordinator.wait(*job_id, args.wait_timeout) => job?,
        };
        results.push(JobOutput::new(model, &job));
    }

    if args.serve || args.models.is_empty() {
        tracing::info!("Serving until shutdown signal");
        shutdown.cancelled().await;
    }

    let report = engine.shutdown().await;
    if !report.clean {
        tracing::warn!("Some jobs did not stop before the shutdown deadline");
    }

    print_results(results, &args.output)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Run(args) => run(args).await,
    }
}
