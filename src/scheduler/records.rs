//! Records of finished jobs, one JSON file per job.
//!
//! Live jobs are rebuilt from their stream entries after a restart; finished
//! ones have no entry left, so their final state is kept here.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::cache::write_atomic;
use crate::error::Result;
use crate::scheduler::job::Job;

pub struct JobRecordStore {
    dir: PathBuf,
}

impl JobRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    pub async fn save(&self, job: &Job) -> Result<()> {
        write_atomic(&self.path(job.id), &serde_json::to_vec(job)?).await
    }

    pub async fn load(&self, job_id: Uuid) -> Result<Option<Job>> {
        match tokio::fs::read(self.path(job_id)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove(&self, job_id: Uuid) -> Result<bool> {
        match tokio::fs::remove_file(self.path(job_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every stored record. Unreadable files are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<Job>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut jobs = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(crate::error::SlicerError::from)
                .and_then(|raw| serde_json::from_slice::<Job>(&raw).map_err(Into::into));
            match parsed {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable job record");
                }
            }
        }
        Ok(jobs)
    }
}
