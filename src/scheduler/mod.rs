//! Job lifecycle: state machine, fingerprints, leases and the coordinator
//! that commits every transition.
//!
//! # Components
//!
//! - [`Job`] / [`JobStatus`]: the job record and its state machine
//! - [`Fingerprint`]: content hash used as the cache key
//! - [`LeaseTable`]: at most one live lease per job
//! - [`Coordinator`]: claims, commits, reclaims and answers submissions
//! - [`LivenessMonitor`]: reclaims jobs from workers presumed dead
//! - [`JobRecordStore`]: final state of finished jobs, kept across restarts

pub mod coordinator;
pub mod fingerprint;
pub mod job;
pub mod lease;
pub mod monitor;
pub mod records;

pub use coordinator::{
    Assignment, AttemptResult, CommitOutcome, Coordinator, SubmissionApi, WorkerOutcome,
};
pub use fingerprint::Fingerprint;
pub use job::{
    AttemptOutcome, AttemptRecord, DeadLetterReport, Job, JobResult, JobStatus, SliceParams,
};
pub use lease::{Lease, LeaseTable};
pub use monitor::LivenessMonitor;
pub use records::JobRecordStore;
