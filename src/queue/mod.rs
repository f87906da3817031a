//! Job queue client over a durable consumer-group stream.
//!
//! The client is the only component that talks to the stream. It owns the
//! wire format of a job ([`QueueMessage`], JSON), retries transient stream
//! failures with exponential backoff, and decides on `nack` whether a job is
//! requeued or dead-lettered.
//!
//! # Components
//!
//! - [`StreamBackend`]: the consumer-group stream seam
//! - [`MemoryStream`]: in-process backend
//! - `RedisStream` (feature `redis`): Redis Streams backend
//! - [`JobQueueClient`]: enqueue / claim / ack / nack / touch

pub mod backend;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Result, SlicerError};
use crate::retry::with_backoff;
use crate::scheduler::fingerprint::Fingerprint;
use crate::scheduler::job::SliceParams;

pub use backend::{BackendError, DeadLetterEntry, Delivery, EntryId, StreamBackend};
pub use memory::MemoryStream;

/// Durable form of a job. Everything needed to execute, retry or
/// dead-letter the job is in here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: Uuid,
    pub fingerprint: Fingerprint,
    pub model_path: PathBuf,
    pub params: SliceParams,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    /// Detail of the most recent failed attempt
    #[serde(default)]
    pub last_error: Option<String>,
}

/// A message delivered to one consumer and pending until acked or nacked.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub entry_id: EntryId,
    pub consumer: String,
    pub delivery_count: u32,
    pub message: QueueMessage,
}

impl ClaimedJob {
    pub fn job_id(&self) -> Uuid {
        self.message.job_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackReason {
    /// The attempt failed; counts against the retry budget
    Failed(String),
    /// The holder stopped heartbeating; counts against the retry budget
    LeaseExpired,
    /// The attempt was aborted by shutdown; does not count
    Cancelled,
}

impl NackReason {
    fn counts_against_budget(&self) -> bool {
        !matches!(self, NackReason::Cancelled)
    }

    fn detail(&self) -> String {
        match self {
            NackReason::Failed(detail) => detail.clone(),
            NackReason::LeaseExpired => "lease expired before the job finished".to_string(),
            NackReason::Cancelled => "cancelled".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { attempts: u32, delay: Duration },
    DeadLettered { attempts: u32 },
}

pub struct JobQueueClient {
    backend: Arc<dyn StreamBackend>,
    config: QueueConfig,
}

impl JobQueueClient {
    pub fn new(backend: Arc<dyn StreamBackend>, config: QueueConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a job to the stream.
    ///
    /// # Errors
    ///
    /// `QueueUnavailable` once the configured backoff attempts are spent.
    pub async fn enqueue(&self, message: &QueueMessage) -> Result<Uuid> {
        self.append(message, Duration::ZERO).await?;
        tracing::debug!(
            job_id = %message.job_id,
            stream = %self.config.stream_name,
            "Job enqueued"
        );
        Ok(message.job_id)
    }

    /// Claim up to `max_count` jobs (never more than the configured batch
    /// size) for `consumer`. Entries abandoned by another consumer for
    /// longer than the ack timeout are reclaimed first.
    ///
    /// Payloads that do not parse are dead-lettered and acknowledged so they
    /// cannot block the stream.
    pub async fn claim_batch(&self, consumer: &str, max_count: usize) -> Result<Vec<ClaimedJob>> {
        let count = max_count.min(self.config.batch_size);
        if count == 0 {
            return Ok(Vec::new());
        }

        let backend = &self.backend;
        let ack_timeout = self.config.ack_timeout;
        let deliveries = self
            .call("read_group", move || async move {
                backend.read_group(consumer, count, ack_timeout).await
            })
            .await?;

        let mut claimed = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            match serde_json::from_str::<QueueMessage>(&delivery.payload) {
                Ok(message) => claimed.push(ClaimedJob {
                    entry_id: delivery.entry_id,
                    consumer: consumer.to_string(),
                    delivery_count: delivery.delivery_count,
                    message,
                }),
                Err(e) => {
                    tracing::error!(
                        entry_id = %delivery.entry_id,
                        error = %e,
                        "Malformed queue entry, dead-lettering"
                    );
                    let reason = format!("malformed payload: {e}");
                    let payload = delivery.payload.as_str();
                    let reason = reason.as_str();
                    self.call("dead_letter", move || async move {
                        backend.dead_letter(payload, reason).await
                    })
                    .await?;
                    self.ack_entry(&delivery.entry_id).await?;
                }
            }
        }
        Ok(claimed)
    }

    /// Acknowledge a claimed job; its entry leaves the pending list.
    pub async fn ack(&self, claimed: &ClaimedJob) -> Result<()> {
        if !self.ack_entry(&claimed.entry_id).await? {
            tracing::debug!(
                job_id = %claimed.job_id(),
                entry_id = %claimed.entry_id,
                "Ack for entry that was no longer pending"
            );
        }
        Ok(())
    }

    /// Give a claimed job back.
    ///
    /// `Cancelled` requeues immediately with the attempt count unchanged.
    /// Other reasons consume one attempt: below `max_retries` the job is
    /// requeued behind the retry delay, at `max_retries` it is dead-lettered.
    /// The replacement entry is written before the old one is acknowledged.
    pub async fn nack(&self, claimed: &ClaimedJob, reason: NackReason) -> Result<NackOutcome> {
        let mut message = claimed.message.clone();

        let outcome = if reason.counts_against_budget() {
            message.attempts += 1;
            message.last_error = Some(reason.detail());
            if message.attempts >= self.config.max_retries {
                let payload = serde_json::to_string(&message)?;
                let detail = reason.detail();
                let backend = &self.backend;
                let (payload, detail) = (payload.as_str(), detail.as_str());
                self.call("dead_letter", move || async move {
                    backend.dead_letter(payload, detail).await
                })
                .await?;
                tracing::warn!(
                    job_id = %message.job_id,
                    attempts = message.attempts,
                    reason = %reason.detail(),
                    "Job dead-lettered"
                );
                NackOutcome::DeadLettered {
                    attempts: message.attempts,
                }
            } else {
                self.append(&message, self.config.retry_delay).await?;
                NackOutcome::Requeued {
                    attempts: message.attempts,
                    delay: self.config.retry_delay,
                }
            }
        } else {
            self.append(&message, Duration::ZERO).await?;
            NackOutcome::Requeued {
                attempts: message.attempts,
                delay: Duration::ZERO,
            }
        };

        // The replacement is durable; a failed ack only means a duplicate
        // delivery later, which the lease table absorbs.
        if let Err(e) = self.ack_entry(&claimed.entry_id).await {
            tracing::warn!(
                job_id = %claimed.job_id(),
                entry_id = %claimed.entry_id,
                error = %e,
                "Failed to ack replaced entry"
            );
        }

        Ok(outcome)
    }

    /// Reset the idle clock of a claimed entry so it is not redelivered
    /// while its holder is alive.
    pub async fn touch(&self, claimed: &ClaimedJob) -> Result<bool> {
        let backend = &self.backend;
        let (entry_id, consumer) = (claimed.entry_id.as_str(), claimed.consumer.as_str());
        self.call("touch", move || async move {
            backend.touch(entry_id, consumer).await
        })
        .await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        let backend = &self.backend;
        self.call("dead_letters", move || async move { backend.dead_letters().await })
            .await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let backend = &self.backend;
        self.call("pending_count", move || async move {
            backend.pending_count().await
        })
        .await
    }

    async fn append(&self, message: &QueueMessage, visible_after: Duration) -> Result<EntryId> {
        let payload = serde_json::to_string(message)?;
        let backend = &self.backend;
        let payload = payload.as_str();
        self.call("append", move || async move {
            backend.append(payload, visible_after).await
        })
        .await
    }

    async fn ack_entry(&self, entry_id: &str) -> Result<bool> {
        let backend = &self.backend;
        self.call("ack", move || async move { backend.ack(entry_id).await })
            .await
    }

    async fn call<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, BackendError>>,
    {
        with_backoff(&self.config.backoff, operation, BackendError::is_retryable, op)
            .await
            .map_err(|(attempts, e)| match e {
                BackendError::Unavailable(reason) => {
                    SlicerError::QueueUnavailable { attempts, reason }
                }
                BackendError::Command(reason) => {
                    SlicerError::Internal(format!("{operation}: {reason}"))
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;

    fn config() -> QueueConfig {
        QueueConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            batch_size: 4,
            ack_timeout: Duration::from_secs(60),
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                max_attempts: 3,
            },
            ..Default::default()
        }
    }

    fn message() -> QueueMessage {
        QueueMessage {
            job_id: Uuid::new_v4(),
            fingerprint: Fingerprint::new("f1"),
            model_path: PathBuf::from("/models/cube.stl"),
            params: SliceParams::default(),
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }

    fn client() -> (Arc<MemoryStream>, JobQueueClient) {
        let stream = Arc::new(MemoryStream::new("slicer:jobs"));
        let client = JobQueueClient::new(stream.clone(), config());
        (stream, client)
    }

    #[tokio::test]
    async fn enqueue_then_claim() {
        let (_stream, client) = client();
        let msg = message();
        let id = client.enqueue(&msg).await.unwrap();
        assert_eq!(id, msg.job_id);

        let claimed = client.claim_batch("worker-1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].message, msg);
        assert_eq!(claimed[0].consumer, "worker-1");
    }

    #[tokio::test]
    async fn claim_is_capped_by_batch_size() {
        let (_stream, client) = client();
        for _ in 0..6 {
            client.enqueue(&message()).await.unwrap();
        }
        assert_eq!(client.claim_batch("w", 100).await.unwrap().len(), 4);
        assert_eq!(client.claim_batch("w", 1).await.unwrap().len(), 1);
        assert!(client.claim_batch("w", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_retries_transient_failures() {
        let (stream, client) = client();
        stream.fail_next(2);
        assert!(client.enqueue(&message()).await.is_ok());
    }

    #[tokio::test]
    async fn enqueue_fails_with_queue_unavailable() {
        let (stream, client) = client();
        stream.set_available(false);
        let err = client.enqueue(&message()).await.unwrap_err();
        match err {
            SlicerError::QueueUnavailable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn nack_failed_requeues_with_delay() {
        let (stream, client) = client();
        client.enqueue(&message()).await.unwrap();
        let claimed = client.claim_batch("w", 1).await.unwrap().remove(0);

        let outcome = client
            .nack(&claimed, NackReason::Failed("exit 1".to_string()))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            NackOutcome::Requeued {
                attempts: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(stream.pending_count().await.unwrap(), 0);

        assert!(client.claim_batch("w", 1).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(150)).await;
        let again = client.claim_batch("w", 1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message.attempts, 1);
        assert_eq!(again[0].message.last_error.as_deref(), Some("exit 1"));
    }

    #[tokio::test]
    async fn nack_cancelled_does_not_consume_attempt() {
        let (_stream, client) = client();
        client.enqueue(&message()).await.unwrap();
        let claimed = client.claim_batch("w", 1).await.unwrap().remove(0);

        let outcome = client.nack(&claimed, NackReason::Cancelled).await.unwrap();
        assert_eq!(
            outcome,
            NackOutcome::Requeued {
                attempts: 0,
                delay: Duration::ZERO
            }
        );
        let again = client.claim_batch("w", 1).await.unwrap();
        assert_eq!(again[0].message.attempts, 0);
    }

    #[tokio::test]
    async fn nack_at_budget_dead_letters() {
        let (_stream, client) = client();
        let mut msg = message();
        msg.attempts = 2;
        client.enqueue(&msg).await.unwrap();
        let claimed = client.claim_batch("w", 1).await.unwrap().remove(0);

        let outcome = client
            .nack(&claimed, NackReason::Failed("still broken".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered { attempts: 3 });

        let dead = client.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "still broken");
        let parsed: QueueMessage = serde_json::from_str(&dead[0].payload).unwrap();
        assert_eq!(parsed.attempts, 3);
        assert_eq!(client.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_entry_is_dead_lettered() {
        let (stream, client) = client();
        stream.append("not json", Duration::ZERO).await.unwrap();

        assert!(client.claim_batch("w", 10).await.unwrap().is_empty());
        assert_eq!(client.dead_letters().await.unwrap().len(), 1);
        assert_eq!(client.pending_count().await.unwrap(), 0);
    }
}
