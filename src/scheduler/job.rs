use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SlicerError};
use crate::queue::QueueMessage;
use crate::scheduler::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Claimed,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    DeadLettered,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Claimed => write!(f, "claimed"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::DeadLettered)
    }

    /// Edges of the job state machine.
    ///
    /// `Queued -> Succeeded` and `Claimed -> Succeeded` are cache hits.
    /// `Claimed -> Failed` covers attempts that fail before the slicer starts.
    /// `Claimed/Running -> Queued/DeadLettered` are lease reclaims.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Claimed)
                | (Queued, Succeeded)
                | (Claimed, Running)
                | (Claimed, Succeeded)
                | (Claimed, Failed)
                | (Claimed, Cancelled)
                | (Claimed, Queued)
                | (Claimed, DeadLettered)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Queued)
                | (Running, DeadLettered)
                | (Failed, Queued)
                | (Failed, DeadLettered)
                | (Cancelled, Queued)
        )
    }
}

/// Slicing parameters passed through to the slicer binary.
///
/// Overrides live in a sorted map so the serialized form, and therefore the
/// job fingerprint, does not depend on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceParams {
    /// 1-based plate index for multi-plate `.3mf` projects
    pub plate: Option<u32>,
    pub printer: Option<String>,
    pub filament: Option<String>,
    pub process: Option<String>,
    pub overrides: BTreeMap<String, String>,
}

impl SliceParams {
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    Cancelled,
    LeaseExpired,
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptOutcome::Succeeded => write!(f, "succeeded"),
            AttemptOutcome::Failed => write!(f, "failed"),
            AttemptOutcome::Cancelled => write!(f, "cancelled"),
            AttemptOutcome::LeaseExpired => write!(f, "lease_expired"),
        }
    }
}

/// One finished execution of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt count after this attempt was committed
    pub attempt: u32,
    pub worker_id: String,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub fingerprint: Fingerprint,
    pub model_path: PathBuf,
    pub params: SliceParams,
    pub status: JobStatus,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_claimed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub result_path: Option<PathBuf>,
    pub error: Option<String>,
    pub history: Vec<AttemptRecord>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(fingerprint: Fingerprint, model_path: PathBuf, params: SliceParams) -> Self {
        Self::with_id(Uuid::new_v4(), fingerprint, model_path, params)
    }

    pub fn with_id(
        id: Uuid,
        fingerprint: Fingerprint,
        model_path: PathBuf,
        params: SliceParams,
    ) -> Self {
        Self {
            id,
            fingerprint,
            model_path,
            params,
            status: JobStatus::Queued,
            attempts: 0,
            enqueued_at: Utc::now(),
            last_claimed_at: None,
            worker_id: None,
            result_path: None,
            error: None,
            history: Vec::new(),
            completed_at: None,
        }
    }

    /// Rebuild a job record from its durable queue message. Used when a
    /// message is claimed by a process that never saw the submission.
    pub fn from_message(msg: &QueueMessage) -> Self {
        Self {
            id: msg.job_id,
            fingerprint: msg.fingerprint.clone(),
            model_path: msg.model_path.clone(),
            params: msg.params.clone(),
            status: JobStatus::Queued,
            attempts: msg.attempts,
            enqueued_at: msg.enqueued_at,
            last_claimed_at: None,
            worker_id: None,
            result_path: None,
            error: msg.last_error.clone(),
            history: Vec::new(),
            completed_at: None,
        }
    }

    /// Move to `next`, rejecting edges that are not in the state machine.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SlicerError::Internal(format!(
                "invalid transition {} -> {} for job {}",
                self.status, next, self.id
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn record_attempt(&mut self, worker_id: &str, outcome: AttemptOutcome, error: Option<String>) {
        self.history.push(AttemptRecord {
            attempt: self.attempts,
            worker_id: worker_id.to_string(),
            outcome,
            error,
            finished_at: Utc::now(),
        });
    }

    pub fn dead_letter_report(&self) -> DeadLetterReport {
        DeadLetterReport {
            job_id: self.id,
            fingerprint: self.fingerprint.clone(),
            attempts: self.attempts,
            last_error: self.error.clone().unwrap_or_default(),
            history: self.history.clone(),
        }
    }
}

/// Permanent failure surfaced to the submitter once the retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterReport {
    pub job_id: Uuid,
    pub fingerprint: Fingerprint,
    pub attempts: u32,
    pub last_error: String,
    pub history: Vec<AttemptRecord>,
}

impl std::fmt::Display for DeadLetterReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Job {} dead-lettered after {} attempts: {}",
            self.job_id, self.attempts, self.last_error
        )
    }
}

/// Answer to a result query from the submission interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Ready(PathBuf),
    NotReady(JobStatus),
    Failed(DeadLetterReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            Fingerprint::new("f1"),
            PathBuf::from("/models/a.stl"),
            SliceParams::default(),
        )
    }

    #[test]
    fn new_job_is_queued() {
        let job = job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.result_path.is_none());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn happy_path_transitions() {
        let mut job = job();
        job.transition(JobStatus::Claimed).unwrap();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Succeeded).unwrap();
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [JobStatus::Succeeded, JobStatus::DeadLettered] {
            for next in [
                JobStatus::Queued,
                JobStatus::Claimed,
                JobStatus::Running,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn cannot_skip_claim() {
        let mut job = job();
        assert!(job.transition(JobStatus::Running).is_err());
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn cancelled_only_returns_to_queue() {
        assert!(JobStatus::Cancelled.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::DeadLettered));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Succeeded));
    }

    #[test]
    fn dead_letter_report_carries_history() {
        let mut job = job();
        job.attempts = 1;
        job.error = Some("boom".to_string());
        job.record_attempt("worker-1", AttemptOutcome::Failed, Some("boom".to_string()));

        let report = job.dead_letter_report();
        assert_eq!(report.attempts, 1);
        assert_eq!(report.last_error, "boom");
        assert_eq!(report.history.len(), 1);
        assert_eq!(report.history[0].worker_id, "worker-1");
        assert!(report.to_string().contains("after 1 attempts"));
    }

    #[test]
    fn params_serialize_in_key_order() {
        let a = SliceParams::default()
            .with_override("b", "2")
            .with_override("a", "1");
        let b = SliceParams::default()
            .with_override("a", "1")
            .with_override("b", "2");
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
