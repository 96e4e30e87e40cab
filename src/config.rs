//! Store configuration.
//!
//! All knobs ship with defaults tuned for a single-node chat deployment.
//! Tests override them aggressively (tiny segments, short flush intervals)
//! to exercise rollover and batching paths quickly.

use std::time::Duration;

/// Tunable parameters for the record store and ingestion pipeline.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Record capacity of one message segment file. When the active
    /// segment reaches this count, writes roll over to the next index.
    pub max_records_per_segment: usize,

    /// How long a cache entry may be served without re-reading the
    /// backing file.
    pub cache_ttl: Duration,

    /// Max concurrent physical reads per collection. Excess readers get
    /// the stale cache entry (if any) or one backoff retry.
    pub max_concurrent_reads: usize,

    /// Fixed backoff before the single read retry when throttled with
    /// no stale entry to fall back on.
    pub read_retry_backoff: Duration,

    /// Per-room buffer size that triggers an immediate flush.
    pub batch_size: usize,

    /// Period of the background flush tick. Upper bound on how long an
    /// enqueued message stays buffered in memory.
    pub flush_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_records_per_segment: 100_000,
            cache_ttl: Duration::from_secs(5),
            max_concurrent_reads: 4,
            read_retry_backoff: Duration::from_millis(50),
            batch_size: 64,
            flush_interval: Duration::from_millis(200),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
