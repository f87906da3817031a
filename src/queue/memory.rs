//! In-process consumer-group stream.
//!
//! Mirrors the Redis Streams semantics the engine relies on (one consumer
//! per entry, pending entries list, idle reclaim, delayed visibility) without
//! a server. State lives in memory, so it is durable only for the lifetime of
//! the process; use the Redis backend when jobs must survive a restart.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::queue::backend::{BackendError, DeadLetterEntry, Delivery, EntryId, StreamBackend};

#[derive(Debug)]
struct StoredEntry {
    payload: String,
    visible_at: Instant,
}

#[derive(Debug)]
struct PendingEntry {
    payload: String,
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct StreamState {
    next_seq: u64,
    ready: BTreeMap<u64, StoredEntry>,
    pending: BTreeMap<u64, PendingEntry>,
    dead: Vec<DeadLetterEntry>,
}

impl StreamState {
    fn next_id(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[derive(Debug)]
pub struct MemoryStream {
    stream_name: String,
    state: Mutex<StreamState>,
    available: AtomicBool,
    failures_remaining: AtomicU32,
}

fn format_entry_id(seq: u64) -> EntryId {
    format!("{}-0", seq)
}

fn parse_entry_id(entry_id: &str) -> Option<u64> {
    entry_id.split('-').next()?.parse().ok()
}

impl MemoryStream {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            state: Mutex::new(StreamState::default()),
            available: AtomicBool::new(true),
            failures_remaining: AtomicU32::new(0),
        }
    }

    /// Simulate the stream going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` operations with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Entries not yet delivered, including delayed ones.
    pub async fn ready_count(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(format!(
                "stream {} is offline",
                self.stream_name
            )));
        }
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(BackendError::Unavailable(format!(
                "stream {} connection reset",
                self.stream_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamBackend for MemoryStream {
    async fn append(
        &self,
        payload: &str,
        visible_after: Duration,
    ) -> Result<EntryId, BackendError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let seq = state.next_id();
        state.ready.insert(
            seq,
            StoredEntry {
                payload: payload.to_string(),
                visible_at: Instant::now() + visible_after,
            },
        );
        Ok(format_entry_id(seq))
    }

    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        min_idle: Duration,
    ) -> Result<Vec<Delivery>, BackendError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut deliveries = Vec::new();

        for (seq, entry) in state.pending.iter_mut() {
            if deliveries.len() >= count {
                break;
            }
            if now.duration_since(entry.delivered_at) < min_idle {
                continue;
            }
            tracing::debug!(
                stream = %self.stream_name,
                entry_id = %format_entry_id(*seq),
                from = %entry.consumer,
                to = consumer,
                "Reclaiming idle entry"
            );
            entry.consumer = consumer.to_string();
            entry.delivered_at = now;
            entry.delivery_count += 1;
            deliveries.push(Delivery {
                entry_id: format_entry_id(*seq),
                payload: entry.payload.clone(),
                delivery_count: entry.delivery_count,
            });
        }

        let visible: Vec<u64> = state
            .ready
            .iter()
            .filter(|(_, e)| e.visible_at <= now)
            .map(|(seq, _)| *seq)
            .take(count.saturating_sub(deliveries.len()))
            .collect();

        for seq in visible {
            if let Some(entry) = state.ready.remove(&seq) {
                deliveries.push(Delivery {
                    entry_id: format_entry_id(seq),
                    payload: entry.payload.clone(),
                    delivery_count: 1,
                });
                state.pending.insert(
                    seq,
                    PendingEntry {
                        payload: entry.payload,
                        consumer: consumer.to_string(),
                        delivered_at: now,
                        delivery_count: 1,
                    },
                );
            }
        }

        Ok(deliveries)
    }

    async fn ack(&self, entry_id: &str) -> Result<bool, BackendError> {
        self.check_available()?;
        let Some(seq) = parse_entry_id(entry_id) else {
            return Ok(false);
        };
        Ok(self.state.lock().await.pending.remove(&seq).is_some())
    }

    async fn touch(&self, entry_id: &str, consumer: &str) -> Result<bool, BackendError> {
        self.check_available()?;
        let Some(seq) = parse_entry_id(entry_id) else {
            return Ok(false);
        };
        let mut state = self.state.lock().await;
        match state.pending.get_mut(&seq) {
            Some(entry) if entry.consumer == consumer => {
                entry.delivered_at = Instant::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn dead_letter(&self, payload: &str, reason: &str) -> Result<EntryId, BackendError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let entry_id = format_entry_id(state.next_id());
        state.dead.push(DeadLetterEntry {
            entry_id: entry_id.clone(),
            payload: payload.to_string(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        Ok(entry_id)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, BackendError> {
        self.check_available()?;
        Ok(self.state.lock().await.dead.clone())
    }

    async fn pending_count(&self) -> Result<usize, BackendError> {
        self.check_available()?;
        Ok(self.state.lock().await.pending.len())
    }
}
