use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream-assigned identifier of one entry. Requeueing a job appends a new
/// entry, so one job may own several entry ids over its lifetime.
pub type EntryId = String;

/// An entry handed to a consumer and now pending until acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub entry_id: EntryId,
    pub payload: String,
    /// 1 on first delivery, incremented each time the entry is reclaimed
    pub delivery_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub entry_id: EntryId,
    pub payload: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("stream unreachable: {0}")]
    Unavailable(String),

    #[error("stream command failed: {0}")]
    Command(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// A durable stream read through a single consumer group.
///
/// Every entry is delivered to one consumer at a time. An entry stays
/// pending until acknowledged; a pending entry idle for longer than the
/// reader's `min_idle` is handed to the next reader (at-least-once).
#[async_trait]
pub trait StreamBackend: Send + Sync + 'static {
    /// Append an entry that readers will not see before `visible_after`
    /// has elapsed.
    async fn append(&self, payload: &str, visible_after: Duration)
        -> Result<EntryId, BackendError>;

    /// Reclaim pending entries idle for at least `min_idle`, then read new
    /// visible entries, up to `count` in total.
    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        min_idle: Duration,
    ) -> Result<Vec<Delivery>, BackendError>;

    /// Returns false if the entry was not pending.
    async fn ack(&self, entry_id: &str) -> Result<bool, BackendError>;

    /// Reset the idle time of a pending entry held by `consumer`.
    async fn touch(&self, entry_id: &str, consumer: &str) -> Result<bool, BackendError>;

    async fn dead_letter(&self, payload: &str, reason: &str) -> Result<EntryId, BackendError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, BackendError>;

    async fn pending_count(&self) -> Result<usize, BackendError>;
}
