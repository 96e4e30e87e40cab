//! Cached record store: one JSON collection file per `Collection<T>`.
//!
//! Read path:  cache (fresh) -> physical read -> stale cache / empty fallback
//! Write path: resource queue slot -> tmp file -> atomic rename -> cache refresh
//!
//! The file on disk is the authoritative state; the cache is a best-effort,
//! possibly-stale mirror with a TTL bound. Reads fail open: a transient disk
//! error degrades to the stale entry (or an empty collection), never to a
//! caller-visible error. Writes fail closed and surface through the queue.
//!
//! Single-writer-process assumption: every mutation of a collection goes
//! through the owning store's `ResourceQueue` under this collection's key,
//! and every successful write refreshes the cache before the caller's
//! result resolves. Inside a queue slot the cache therefore always reflects
//! the last committed write, which is what makes read-modify-write safe.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::queue::ResourceQueue;
use crate::records::now_millis;

// ── Cache entry ─────────────────────────────────────────────────────

struct CacheEntry<T> {
    value: Arc<Vec<T>>,
    refreshed_at: Instant,
}

/// Read/cache counters, exposed for tests and stats reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectionStats {
    /// Physical file reads performed.
    pub physical_reads: u64,
    /// Reads served from a fresh cache entry.
    pub cache_hits: u64,
    /// Reads that degraded to a stale entry or empty fallback.
    pub degraded_reads: u64,
}

// ── Collection ──────────────────────────────────────────────────────

/// One named record collection persisted as a single JSON array file.
pub struct Collection<T> {
    path: PathBuf,
    /// Queue key — the collection's path. All mutations serialize on it.
    key: String,
    queue: Arc<ResourceQueue>,
    config: Arc<StoreConfig>,
    cache: Mutex<Option<CacheEntry<T>>>,
    inflight_reads: AtomicUsize,
    physical_reads: AtomicU64,
    cache_hits: AtomicU64,
    degraded_reads: AtomicU64,
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(path: impl Into<PathBuf>, queue: Arc<ResourceQueue>, config: Arc<StoreConfig>) -> Self {
        let path = path.into();
        let key = path.to_string_lossy().into_owned();
        Self {
            path,
            key,
            queue,
            config,
            cache: Mutex::new(None),
            inflight_reads: AtomicUsize::new(0),
            physical_reads: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            degraded_reads: AtomicU64::new(0),
        }
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> CollectionStats {
        CollectionStats {
            physical_reads: self.physical_reads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            degraded_reads: self.degraded_reads.load(Ordering::Relaxed),
        }
    }

    // ── Read path ───────────────────────────────────────────────────

    /// Read the collection, serving the cache entry when it is younger
    /// than `cache_ttl`. Throttled or failing physical reads degrade to
    /// the stale entry, then to an empty collection. Never errors.
    pub async fn read(&self) -> Arc<Vec<T>> {
        if let Some(fresh) = self.cached(true) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return fresh;
        }

        // Reserve a slot before reading; a plain load-then-read would let
        // racing readers overshoot the bound.
        let guard =
            match InflightGuard::try_enter(&self.inflight_reads, self.config.max_concurrent_reads)
            {
                Some(guard) => guard,
                None => {
                    if let Some(stale) = self.cached(false) {
                        self.degraded_reads.fetch_add(1, Ordering::Relaxed);
                        return stale;
                    }
                    // No fallback value at all: one fixed backoff, one retry.
                    tokio::time::sleep(self.config.read_retry_backoff).await;
                    if let Some(any) = self.cached(false) {
                        self.degraded_reads.fetch_add(1, Ordering::Relaxed);
                        return any;
                    }
                    match InflightGuard::try_enter(
                        &self.inflight_reads,
                        self.config.max_concurrent_reads,
                    ) {
                        Some(guard) => guard,
                        None => {
                            self.degraded_reads.fetch_add(1, Ordering::Relaxed);
                            return Arc::new(Vec::new());
                        }
                    }
                }
            };

        self.read_physical(guard).await
    }

    /// Strict load for read-modify-write. Must only be called from inside
    /// this collection's queue slot: the cache (at any age) is then the
    /// last committed state. A transient disk error or an unparseable
    /// file is a hard error here — falling back to empty would rewrite
    /// the collection from scratch.
    async fn load_for_update(&self) -> Result<Vec<T>> {
        if let Some(entry) = self.cached(false) {
            return Ok((*entry).clone());
        }
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::InvalidCollection {
                    file: self.key.clone(),
                    reason: e.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_physical(&self, _guard: InflightGuard<'_>) -> Arc<Vec<T>> {
        self.physical_reads.fetch_add(1, Ordering::Relaxed);

        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<T>>(&bytes) {
                Ok(records) => self.refresh_cache(records),
                Err(e) => {
                    tracing::warn!(
                        "collection '{}': parse failed ({} bytes): {}",
                        self.key,
                        bytes.len(),
                        e
                    );
                    self.fallback()
                }
            },
            // Missing file is the legitimate initial state, not a failure.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.refresh_cache(Vec::new()),
            Err(e) => {
                tracing::warn!("collection '{}': read failed: {}", self.key, e);
                self.fallback()
            }
        }
    }

    fn fallback(&self) -> Arc<Vec<T>> {
        self.degraded_reads.fetch_add(1, Ordering::Relaxed);
        self.cached(false).unwrap_or_else(|| Arc::new(Vec::new()))
    }

    fn cached(&self, require_fresh: bool) -> Option<Arc<Vec<T>>> {
        let guard = self.cache.lock().expect("cache lock poisoned");
        let entry = guard.as_ref()?;
        if require_fresh && entry.refreshed_at.elapsed() >= self.config.cache_ttl {
            return None;
        }
        Some(Arc::clone(&entry.value))
    }

    fn refresh_cache(&self, records: Vec<T>) -> Arc<Vec<T>> {
        let value = Arc::new(records);
        let mut guard = self.cache.lock().expect("cache lock poisoned");
        *guard = Some(CacheEntry {
            value: Arc::clone(&value),
            refreshed_at: Instant::now(),
        });
        value
    }

    // ── Write path ──────────────────────────────────────────────────

    /// Replace the collection's contents. Serializes on this collection's
    /// queue key; the caller observes the durable-write outcome.
    pub async fn write(self: &Arc<Self>, records: Vec<T>) -> Result<()> {
        let this = Arc::clone(self);
        self.queue
            .run(&self.key, async move { this.write_in_slot(records).await })
            .await
    }

    /// Read-modify-write as one queue slot. `f` receives the current
    /// records and returns the records to persist plus the caller's
    /// result; the write is durable before the result resolves.
    pub async fn mutate<F, R>(self: &Arc<Self>, f: F) -> Result<R>
    where
        F: FnOnce(Vec<T>) -> Result<(Vec<T>, R)> + Send + 'static,
        R: Send + 'static,
    {
        let this = Arc::clone(self);
        self.queue
            .run(&self.key, async move {
                let current = this.load_for_update().await?;
                let (next, out) = f(current)?;
                this.write_in_slot(next).await?;
                Ok(out)
            })
            .await
    }

    /// Durable write: unique tmp file, then atomic rename over the target,
    /// so a reader never observes a partially written file. On success the
    /// cache is refreshed synchronously (no read-after-write miss).
    ///
    /// Must only run inside this collection's queue slot.
    async fn write_in_slot(&self, records: Vec<T>) -> Result<()> {
        let bytes = serde_json::to_vec(&records)?;
        let tmp = self.tmp_path();

        let outcome = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &self.path).await?;
            Ok::<_, crate::error::StoreError>(())
        }
        .await;

        if let Err(e) = outcome {
            tracing::warn!(
                "collection '{}': write failed ({} records, {} bytes): {}",
                self.key,
                records.len(),
                bytes.len(),
                e
            );
            // Best effort: do not leave the tmp file behind.
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        self.refresh_cache(records);
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let suffix: u32 = rand::thread_rng().gen_range(0..0x1_0000);
        let name = format!(
            "{}.tmp.{}.{:04x}",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "collection".to_string()),
            now_millis(),
            suffix
        );
        self.path.with_file_name(name)
    }
}

struct InflightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InflightGuard<'a> {
    /// Reserve one in-flight slot, or back out if the bound is already
    /// reached. Reserving first (instead of load-then-enter) keeps the
    /// bound exact when readers race.
    fn try_enter(counter: &'a AtomicUsize, max: usize) -> Option<Self> {
        let prev = counter.fetch_add(1, Ordering::SeqCst);
        if prev >= max {
            counter.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Self { counter })
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Tests ───────────────────────────────────────────────────────────
