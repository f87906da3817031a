//! Content-addressed result cache.
//!
//! Maps a job fingerprint to the location of an already computed artifact.
//! Reads are shared by every worker; writes happen only from the coordinator
//! after an outcome is committed, under that fingerprint's lock.
//!
//! A cache opened with an index file survives restarts: the index is
//! rewritten after every change, and a job reclaimed after a crash finds the
//! artifact its previous worker produced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::scheduler::fingerprint::Fingerprint;

/// File name of the cache index inside the results directory.
pub const INDEX_FILE: &str = "cache-index.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub location: PathBuf,
    pub size: u64,
    pub created_at: Instant,
    pub stored_at: DateTime<Utc>,
}

/// On-disk form of one entry. Ages are kept as wall-clock time.
#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    fingerprint: Fingerprint,
    location: PathBuf,
    size: u64,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<Fingerprint, CacheEntry>,
    total_size: u64,
}

impl CacheState {
    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let entry = self.entries.remove(fingerprint)?;
        self.total_size = self.total_size.saturating_sub(entry.size);
        Some(entry)
    }

    fn remove_expired(&mut self, ttl: Duration, now: Instant) -> usize {
        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.created_at) >= ttl)
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in &expired {
            self.remove(fp);
        }
        expired.len()
    }

    /// Evict oldest entries (ties by fingerprint) until `incoming` more bytes
    /// fit under `max_size`.
    fn make_room(&mut self, incoming: u64, max_size: u64) -> usize {
        if self.total_size.saturating_add(incoming) <= max_size {
            return 0;
        }
        let mut by_age: Vec<(Instant, Fingerprint)> = self
            .entries
            .iter()
            .map(|(fp, e)| (e.created_at, fp.clone()))
            .collect();
        by_age.sort();

        let mut evicted = 0;
        for (_, fp) in by_age {
            if self.total_size.saturating_add(incoming) <= max_size {
                break;
            }
            self.remove(&fp);
            evicted += 1;
        }
        evicted
    }
}

pub struct ResultCache {
    config: CacheConfig,
    state: RwLock<CacheState>,
    index: Option<PathBuf>,
    /// Serializes index rewrites so the last writer holds the latest state
    index_lock: tokio::sync::Mutex<()>,
}

impl ResultCache {
    /// A cache that lives only in memory.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CacheState::default()),
            index: None,
            index_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// A cache backed by the index file at `index`, loading whatever a
    /// previous process left there. Entries already past their TTL are
    /// dropped on load.
    pub async fn open(config: CacheConfig, index: impl Into<PathBuf>) -> Result<Self> {
        let index = index.into();
        let mut state = CacheState::default();

        match tokio::fs::read(&index).await {
            Ok(raw) => {
                let entries: Vec<IndexEntry> = serde_json::from_slice(&raw)?;
                let now = Instant::now();
                let wall = Utc::now();
                for entry in entries {
                    let age = (wall - entry.stored_at).to_std().unwrap_or(Duration::ZERO);
                    if age >= config.ttl {
                        continue;
                    }
                    state.total_size += entry.size;
                    state.entries.insert(
                        entry.fingerprint,
                        CacheEntry {
                            location: entry.location,
                            size: entry.size,
                            created_at: now.checked_sub(age).unwrap_or(now),
                            stored_at: entry.stored_at,
                        },
                    );
                }
                tracing::info!(
                    index = %index.display(),
                    entries = state.entries.len(),
                    total_size = state.total_size,
                    "Result cache index loaded"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            config,
            state: RwLock::new(state),
            index: Some(index),
            index_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Rewrite the index file with the current entries. A no-op for a
    /// memory-only cache.
    pub async fn persist(&self) -> Result<()> {
        let Some(index) = &self.index else {
            return Ok(());
        };
        let _guard = self.index_lock.lock().await;

        let entries: Vec<IndexEntry> = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state
                .entries
                .iter()
                .map(|(fingerprint, entry)| IndexEntry {
                    fingerprint: fingerprint.clone(),
                    location: entry.location.clone(),
                    size: entry.size,
                    stored_at: entry.stored_at,
                })
                .collect()
        };
        write_atomic(index, &serde_json::to_vec(&entries)?).await
    }

    /// Location of the artifact for `fingerprint`. An entry past its TTL is
    /// a miss even if the cleaner has not removed it yet.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let entry = state.entries.get(fingerprint)?;
        if entry.created_at.elapsed() >= self.config.ttl {
            return None;
        }
        Some(entry.location.clone())
    }

    /// Admit an artifact, overwriting any entry for the same fingerprint.
    ///
    /// Expired entries are removed first, then the oldest entries until the
    /// new one fits. Returns false if the artifact alone exceeds `max_size`.
    pub fn put(&self, fingerprint: Fingerprint, location: PathBuf, size: u64) -> bool {
        if size > self.config.max_size {
            tracing::warn!(
                fingerprint = %fingerprint,
                size,
                max_size = self.config.max_size,
                "Artifact larger than cache, not admitted"
            );
            return false;
        }

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.remove(&fingerprint);
        let expired = state.remove_expired(self.config.ttl, Instant::now());
        let evicted = state.make_room(size, self.config.max_size);
        if expired + evicted > 0 {
            tracing::debug!(expired, evicted, "Made room in result cache");
        }

        state.total_size += size;
        state.entries.insert(
            fingerprint,
            CacheEntry {
                location,
                size,
                created_at: Instant::now(),
                stored_at: Utc::now(),
            },
        );
        true
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.remove(fingerprint).is_some()
    }

    /// One cleaning pass: drop expired entries, then oldest entries while
    /// over the size cap. Returns the number of entries removed.
    pub fn evict(&self) -> usize {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let expired = state.remove_expired(self.config.ttl, Instant::now());
        let evicted = state.make_room(0, self.config.max_size);
        expired + evicted
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_size(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .total_size
    }

    /// Run [`evict`](Self::evict) every `clean_interval` until `cancel` fires.
    pub async fn run_cleaner(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.clean_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let removed = self.evict();
                    if removed > 0 {
                        if let Err(e) = self.persist().await {
                            tracing::warn!(error = %e, "Failed to write cache index");
                        }
                        tracing::info!(
                            removed,
                            remaining = self.len(),
                            total_size = self.total_size(),
                            "Result cache cleaned"
                        );
                    }
                }
            }
        }
    }
}

/// Write `data` to a sibling temp file, then rename it over `path`.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_size: u64, ttl: Duration) -> ResultCache {
        ResultCache::new(CacheConfig {
            enabled: true,
            max_size,
            ttl,
            clean_interval: Duration::from_secs(60),
        })
    }

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::new(s)
    }

    #[tokio::test]
    async fn put_then_get() {
        let cache = cache(1000, Duration::from_secs(60));
        assert!(cache.get(&fp("a")).is_none());
        assert!(cache.put(fp("a"), PathBuf::from("/r/a.gcode"), 10));
        assert_eq!(cache.get(&fp("a")), Some(PathBuf::from("/r/a.gcode")));
        assert_eq!(cache.total_size(), 10);
    }

    #[tokio::test]
    async fn put_overwrites() {
        let cache = cache(1000, Duration::from_secs(60));
        cache.put(fp("a"), PathBuf::from("/r/1"), 10);
        cache.put(fp("a"), PathBuf::from("/r/2"), 30);
        assert_eq!(cache.get(&fp("a")), Some(PathBuf::from("/r/2")));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_size(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_a_miss() {
        let cache = cache(1000, Duration::from_secs(10));
        cache.put(fp("a"), PathBuf::from("/r/a"), 10);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get(&fp("a")).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.evict(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_entries_make_room() {
        let cache = cache(100, Duration::from_secs(3600));
        cache.put(fp("old"), PathBuf::from("/r/old"), 40);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.put(fp("mid"), PathBuf::from("/r/mid"), 40);
        tokio::time::advance(Duration::from_secs(1)).await;

        cache.put(fp("new"), PathBuf::from("/r/new"), 40);

        assert!(cache.get(&fp("old")).is_none());
        assert!(cache.get(&fp("mid")).is_some());
        assert!(cache.get(&fp("new")).is_some());
        assert_eq!(cache.total_size(), 80);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_age_evicts_by_fingerprint_order() {
        let cache = cache(100, Duration::from_secs(3600));
        cache.put(fp("b"), PathBuf::from("/r/b"), 50);
        cache.put(fp("a"), PathBuf::from("/r/a"), 50);

        cache.put(fp("c"), PathBuf::from("/r/c"), 50);

        assert!(cache.get(&fp("a")).is_none());
        assert!(cache.get(&fp("b")).is_some());
    }

    #[tokio::test]
    async fn oversize_artifact_is_rejected() {
        let cache = cache(100, Duration::from_secs(60));
        cache.put(fp("a"), PathBuf::from("/r/a"), 50);
        assert!(!cache.put(fp("huge"), PathBuf::from("/r/huge"), 101));
        assert!(cache.get(&fp("a")).is_some());
        assert!(cache.get(&fp("huge")).is_none());
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = cache(100, Duration::from_secs(60));
        cache.put(fp("a"), PathBuf::from("/r/a"), 50);
        assert!(cache.invalidate(&fp("a")));
        assert!(!cache.invalidate(&fp("a")));
        assert_eq!(cache.total_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleaner_runs_on_interval() {
        let cache = std::sync::Arc::new(ResultCache::new(CacheConfig {
            enabled: true,
            max_size: 1000,
            ttl: Duration::from_secs(5),
            clean_interval: Duration::from_secs(10),
        }));
        cache.put(fp("a"), PathBuf::from("/r/a"), 1);

        let cancel = CancellationToken::new();
        let task = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { cache.run_cleaner(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = dir.path().join(INDEX_FILE);
        let config = CacheConfig::default();

        let cache = ResultCache::open(config.clone(), &index).await.unwrap();
        assert!(cache.is_empty());
        cache.put(fp("a"), PathBuf::from("/r/a"), 10);
        cache.put(fp("b"), PathBuf::from("/r/b"), 20);
        cache.persist().await.unwrap();
        cache.invalidate(&fp("b"));
        cache.persist().await.unwrap();
        drop(cache);

        let reopened = ResultCache::open(config, &index).await.unwrap();
        assert_eq!(reopened.get(&fp("a")), Some(PathBuf::from("/r/a")));
        assert!(reopened.get(&fp("b")).is_none());
        assert_eq!(reopened.total_size(), 10);
    }

    #[tokio::test]
    async fn expired_index_entries_are_not_loaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = dir.path().join(INDEX_FILE);
        let stale = vec![IndexEntry {
            fingerprint: fp("old"),
            location: PathBuf::from("/r/old"),
            size: 5,
            stored_at: Utc::now() - chrono::Duration::hours(2),
        }];
        std::fs::write(&index, serde_json::to_vec(&stale).unwrap()).unwrap();

        let cache = ResultCache::open(cache_config(Duration::from_secs(3600)), &index)
            .await
            .unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.total_size(), 0);
    }

    #[tokio::test]
    async fn memory_cache_persist_is_a_noop() {
        let cache = cache(100, Duration::from_secs(60));
        cache.put(fp("a"), PathBuf::from("/r/a"), 1);
        cache.persist().await.unwrap();
    }

    fn cache_config(ttl: Duration) -> CacheConfig {
        CacheConfig {
            ttl,
            ..Default::default()
        }
    }
}
