use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, SlicerError};
use crate::queue::{ClaimedJob, EntryId};

/// Exclusive right of one worker to execute one job until `expires_at`.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job_id: Uuid,
    pub worker_id: String,
    pub claimed: ClaimedJob,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: Instant,
    /// Cancelled when the lease is taken away from its holder
    pub cancel: CancellationToken,
}

impl Lease {
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// A live lease already exists for the job.
#[derive(Debug, Clone)]
pub struct LeaseConflict {
    pub holder: String,
    pub entry_id: EntryId,
}

#[derive(Debug)]
pub struct Acquired {
    pub cancel: CancellationToken,
    /// Expired lease this one replaced; its holder has been cancelled
    pub expired_predecessor: Option<Lease>,
}

type Slot = Arc<Mutex<Option<Lease>>>;

/// Leases keyed by job id.
///
/// The map lock is held to insert or prune a slot; renewals and lookups
/// only take the slot's own lock.
#[derive(Default)]
pub struct LeaseTable {
    slots: RwLock<HashMap<Uuid, Slot>>,
}

fn lock(slot: &Slot) -> std::sync::MutexGuard<'_, Option<Lease>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, job_id: &Uuid) -> Option<Slot> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
    }

    fn prune(&self, job_id: &Uuid) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get(job_id) {
            if lock(slot).is_none() {
                slots.remove(job_id);
            }
        }
    }

    /// Grant `worker_id` a lease on the claimed job for `ttl`.
    ///
    /// Fails if another live lease exists. An expired lease is replaced and
    /// its holder's token cancelled.
    pub fn try_acquire(
        &self,
        claimed: &ClaimedJob,
        worker_id: &str,
        ttl: Duration,
    ) -> std::result::Result<Acquired, LeaseConflict> {
        let job_id = claimed.job_id();
        // Map write lock keeps a concurrent prune from dropping the slot
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let slot = slots.entry(job_id).or_default().clone();
        let mut guard = lock(&slot);
        let now = Instant::now();

        if let Some(existing) = guard.as_ref() {
            if existing.is_live(now) {
                return Err(LeaseConflict {
                    holder: existing.worker_id.clone(),
                    entry_id: existing.claimed.entry_id.clone(),
                });
            }
        }

        let expired_predecessor = guard.take();
        if let Some(old) = &expired_predecessor {
            old.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        *guard = Some(Lease {
            job_id,
            worker_id: worker_id.to_string(),
            claimed: claimed.clone(),
            claimed_at: Utc::now(),
            expires_at: now + ttl,
            cancel: cancel.clone(),
        });

        drop(guard);
        drop(slots);
        Ok(Acquired {
            cancel,
            expired_predecessor,
        })
    }

    /// Push the expiry of a live lease held by `worker_id` forward by `ttl`.
    /// Returns the claimed entry so the caller can touch it in the stream.
    pub fn renew(&self, job_id: Uuid, worker_id: &str, ttl: Duration) -> Result<ClaimedJob> {
        let slot = self.slot(&job_id).ok_or(SlicerError::LeaseExpired(job_id))?;
        let mut guard = lock(&slot);
        let now = Instant::now();
        match guard.as_mut() {
            Some(lease) if lease.worker_id == worker_id && lease.is_live(now) => {
                lease.expires_at = now + ttl;
                Ok(lease.claimed.clone())
            }
            _ => Err(SlicerError::LeaseExpired(job_id)),
        }
    }

    /// The claimed entry behind a live lease held by `worker_id`.
    pub fn held_by(&self, job_id: Uuid, worker_id: &str) -> Option<ClaimedJob> {
        let slot = self.slot(&job_id)?;
        let guard = lock(&slot);
        guard
            .as_ref()
            .filter(|l| l.worker_id == worker_id && l.is_live(Instant::now()))
            .map(|l| l.claimed.clone())
    }

    /// Remove the lease if `worker_id` holds it, live or not.
    pub fn release(&self, job_id: Uuid, worker_id: &str) -> Option<Lease> {
        let slot = self.slot(&job_id)?;
        let released = {
            let mut guard = lock(&slot);
            match guard.as_ref() {
                Some(lease) if lease.worker_id == worker_id => guard.take(),
                _ => None,
            }
        };
        if released.is_some() {
            self.prune(&job_id);
        }
        released
    }

    /// Remove and return every expired lease, cancelling their holders.
    pub fn take_expired(&self) -> Vec<Lease> {
        let slots: Vec<(Uuid, Slot)> = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let now = Instant::now();
        let mut expired = Vec::new();
        for (job_id, slot) in slots {
            let taken = {
                let mut guard = lock(&slot);
                match guard.as_ref() {
                    Some(lease) if !lease.is_live(now) => guard.take(),
                    _ => None,
                }
            };
            if let Some(lease) = taken {
                lease.cancel.cancel();
                expired.push(lease);
                self.prune(&job_id);
            }
        }
        expired
    }

    /// Worker holding a live lease on the job.
    pub fn holder(&self, job_id: Uuid) -> Option<String> {
        let slot = self.slot(&job_id)?;
        let guard = lock(&slot);
        guard
            .as_ref()
            .filter(|l| l.is_live(Instant::now()))
            .map(|l| l.worker_id.clone())
    }

    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|slot| lock(slot).as_ref().is_some_and(|l| l.is_live(now)))
            .count()
    }
}
