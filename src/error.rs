use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::DeadLetterReport;

#[derive(Error, Debug)]
pub enum SlicerError {
    #[error("Queue unavailable after {attempts} attempts: {reason}")]
    QueueUnavailable { attempts: u32, reason: String },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Slicer exited with code {exit_code:?}: {stderr}")]
    ExecutorFailure {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Slicer timed out after {after:?}: {stderr}")]
    ExecutorTimeout { after: Duration, stderr: String },

    #[error("Lease expired for job {0}")]
    LeaseExpired(Uuid),

    #[error("{0}")]
    DeadLettered(Box<DeadLetterReport>),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SlicerError {
    /// Infrastructure errors that are retried locally and never counted
    /// against a job's retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SlicerError::QueueUnavailable { .. } | SlicerError::StorageUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SlicerError>;
