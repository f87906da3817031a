//! Blob storage for model and result files.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{Result, SlicerError};
use crate::retry::with_backoff;

/// Model formats the slicer accepts.
pub const SUPPORTED_MODEL_EXTENSIONS: &[&str] = &["stl", "3mf"];

/// Extension of the sliced artifact.
pub const RESULT_EXTENSION: &str = "gcode";

/// How a submission refers to its model.
#[derive(Debug, Clone)]
pub enum ModelRef {
    /// Raw upload; `name` supplies the file extension
    Bytes { name: String, data: Vec<u8> },
    /// A file already in the blob store
    Stored(PathBuf),
}

/// File storage keyed by job id.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn store_model(&self, job_id: Uuid, name: &str, data: &[u8]) -> Result<PathBuf>;

    async fn store_result(&self, job_id: Uuid, data: &[u8]) -> Result<PathBuf>;

    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Returns false if there was nothing to remove.
    async fn remove(&self, path: &Path) -> Result<bool>;

    /// Where [`store_result`](Self::store_result) puts the artifact of `job_id`.
    fn result_path(&self, job_id: Uuid) -> PathBuf;

    /// Scratch location the executor writes its artifact to.
    fn output_path(&self, job_id: Uuid) -> PathBuf;
}

/// Lowercased extension of `name` if it is a supported model format.
pub fn model_extension(name: &str) -> Result<String> {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| SlicerError::InvalidModel(format!("{name} has no file extension")))?;

    if !SUPPORTED_MODEL_EXTENSIONS.contains(&ext.as_str()) {
        return Err(SlicerError::InvalidModel(format!(
            "unsupported format .{ext}, expected one of: {}",
            SUPPORTED_MODEL_EXTENSIONS.join(", ")
        )));
    }
    Ok(ext)
}

/// Blob store on the local filesystem.
///
/// Models land in `models_path/<job_id>.<ext>`, results in
/// `results_path/<job_id>.gcode`, scratch output in
/// `results_path/tmp/<job_id>.gcode`.
pub struct LocalBlobStore {
    config: StorageConfig,
}

impl LocalBlobStore {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Create the storage directories.
    pub async fn init(&self) -> Result<()> {
        for dir in [
            self.config.models_path.clone(),
            self.config.results_path.clone(),
            self.scratch_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                SlicerError::StorageUnavailable(format!(
                    "cannot create {}: {e}",
                    dir.display()
                ))
            })?;
        }
        Ok(())
    }

    fn scratch_dir(&self) -> PathBuf {
        self.config.results_path.join("tmp")
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.io("write", path, move || async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, data).await
        })
        .await
    }

    async fn io<T, F, Fut>(&self, operation: &str, path: &Path, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::io::Result<T>>,
    {
        with_backoff(
            &self.config.backoff,
            operation,
            |e: &std::io::Error| e.kind() != ErrorKind::NotFound,
            op,
        )
        .await
        .map_err(|(attempts, e)| {
            if e.kind() == ErrorKind::NotFound {
                SlicerError::Io(e)
            } else {
                SlicerError::StorageUnavailable(format!(
                    "{operation} {} failed after {attempts} attempts: {e}",
                    path.display()
                ))
            }
        })
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store_model(&self, job_id: Uuid, name: &str, data: &[u8]) -> Result<PathBuf> {
        let ext = model_extension(name)?;
        if data.is_empty() {
            return Err(SlicerError::InvalidModel(format!("{name} is empty")));
        }
        if data.len() as u64 > self.config.max_file_size {
            return Err(SlicerError::InvalidModel(format!(
                "{name} is {} bytes, limit is {}",
                data.len(),
                self.config.max_file_size
            )));
        }

        let path = self.config.models_path.join(format!("{job_id}.{ext}"));
        self.write(&path, data).await?;
        tracing::debug!(job_id = %job_id, path = %path.display(), size = data.len(), "Model stored");
        Ok(path)
    }

    async fn store_result(&self, job_id: Uuid, data: &[u8]) -> Result<PathBuf> {
        let path = self.result_path(job_id);
        self.write(&path, data).await?;
        tracing::debug!(job_id = %job_id, path = %path.display(), size = data.len(), "Result stored");
        Ok(path)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.io("read", path, move || tokio::fs::read(path)).await
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.io("exists", path, move || tokio::fs::try_exists(path))
            .await
    }

    async fn remove(&self, path: &Path) -> Result<bool> {
        match self.io("remove", path, move || tokio::fs::remove_file(path)).await {
            Ok(()) => Ok(true),
            Err(SlicerError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn result_path(&self, job_id: Uuid) -> PathBuf {
        self.config
            .results_path
            .join(format!("{job_id}.{RESULT_EXTENSION}"))
    }

    fn output_path(&self, job_id: Uuid) -> PathBuf {
        self.scratch_dir().join(format!("{job_id}.{RESULT_EXTENSION}"))
    }
}
