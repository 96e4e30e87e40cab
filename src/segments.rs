//! Shard manager for the message collection.
//!
//! Messages are the only unbounded collection, so they are split into
//! fixed-capacity segment files `messages_<N>.json`. The active segment is
//! filled to capacity, then writes roll over to index `N+1`; one batch may
//! span several rollovers. Indexes increase monotonically and are never
//! reused, even across restarts: startup discovery scans the directory and
//! resumes at the highest index found.
//!
//! Segments are immutable once rolled over, except for room purges, which
//! rewrite every affected segment in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::collection::Collection;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::queue::ResourceQueue;
use crate::records::Message;

const SEGMENT_PREFIX: &str = "messages_";
const SEGMENT_EXT: &str = ".json";

/// Parse the index out of a segment file name (`messages_7.json` -> 7).
/// Tmp files and foreign names yield `None`.
fn parse_segment_index(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_EXT)?
        .parse()
        .ok()
}

fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("{}{}{}", SEGMENT_PREFIX, index, SEGMENT_EXT))
}

struct SegmentState {
    /// Segments ordered oldest-first. The last entry is the active one.
    segments: Vec<(u64, Arc<Collection<Message>>)>,
    /// Record count of the active segment. Corrected from the actual
    /// post-append length on every write, so a bad startup read cannot
    /// drift it permanently.
    current_count: usize,
}

/// The set of message segments in one store directory.
pub struct SegmentSet {
    dir: PathBuf,
    queue: Arc<ResourceQueue>,
    config: Arc<StoreConfig>,
    state: Mutex<SegmentState>,
}

impl SegmentSet {
    /// Open the segment set, discovering existing segments on disk.
    /// Starts at segment 1 when the directory holds none.
    pub async fn open(
        dir: impl Into<PathBuf>,
        queue: Arc<ResourceQueue>,
        config: Arc<StoreConfig>,
    ) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut indexes = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(index) = parse_segment_index(&entry.file_name().to_string_lossy()) {
                indexes.push(index);
            }
        }
        indexes.sort_unstable();
        if indexes.is_empty() {
            indexes.push(1);
        }

        let segments: Vec<(u64, Arc<Collection<Message>>)> = indexes
            .into_iter()
            .map(|index| {
                let col = Arc::new(Collection::new(
                    segment_path(&dir, index),
                    Arc::clone(&queue),
                    Arc::clone(&config),
                ));
                (index, col)
            })
            .collect();

        let current_count = segments
            .last()
            .expect("segment list never empty")
            .1
            .read()
            .await
            .len();

        Ok(Self {
            dir,
            queue,
            config,
            state: Mutex::new(SegmentState {
                segments,
                current_count,
            }),
        })
    }

    /// Index of the active segment.
    pub async fn current_index(&self) -> u64 {
        let state = self.state.lock().await;
        state.segments.last().expect("segment list never empty").0
    }

    /// All segments, oldest to newest by index.
    pub async fn all_segments(&self) -> Vec<Arc<Collection<Message>>> {
        let state = self.state.lock().await;
        state.segments.iter().map(|(_, c)| Arc::clone(c)).collect()
    }

    /// Append a single record (capacity rollover applies as for batches).
    pub async fn append_one(&self, record: Message) -> Result<()> {
        self.append_batch(vec![record]).await
    }

    /// Append a batch, filling the active segment to capacity and rolling
    /// to new segments as needed. Durable when this returns `Ok`.
    pub async fn append_batch(&self, records: Vec<Message>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let capacity = self.config.max_records_per_segment;
        let mut remaining = records;

        while !remaining.is_empty() {
            let space = capacity.saturating_sub(state.current_count);
            if space == 0 {
                self.roll_over(&mut state);
                continue;
            }

            let take = space.min(remaining.len());
            let chunk: Vec<Message> = remaining.drain(..take).collect();
            let active = Arc::clone(&state.segments.last().expect("segment list never empty").1);
            let new_len = active
                .mutate(move |mut existing| {
                    existing.extend(chunk);
                    let n = existing.len();
                    Ok((existing, n))
                })
                .await?;
            state.current_count = new_len;
        }
        Ok(())
    }

    fn roll_over(&self, state: &mut SegmentState) {
        let next = state.segments.last().expect("segment list never empty").0 + 1;
        tracing::debug!("message segment rollover -> {}", next);
        let col = Arc::new(Collection::new(
            segment_path(&self.dir, next),
            Arc::clone(&self.queue),
            Arc::clone(&self.config),
        ));
        state.segments.push((next, col));
        state.current_count = 0;
    }

    /// Remove every message of `room_id` from all segments. Returns the
    /// number of records removed. Segment numbering is unaffected; a
    /// purged non-final segment simply stays below capacity.
    pub async fn purge_room(&self, room_id: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut removed = 0usize;
        let mut last_len = state.current_count;

        for (_, segment) in &state.segments {
            let room = room_id.to_string();
            let (kept, dropped) = Arc::clone(segment)
                .mutate(move |records| {
                    let before = records.len();
                    let kept: Vec<Message> =
                        records.into_iter().filter(|m| m.room_id != room).collect();
                    let dropped = before - kept.len();
                    let kept_len = kept.len();
                    Ok((kept, (kept_len, dropped)))
                })
                .await?;
            removed += dropped;
            last_len = kept;
        }

        state.current_count = last_len;
        Ok(removed)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
