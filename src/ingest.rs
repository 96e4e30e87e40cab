//! Ingestion batcher: absorbs high-frequency message submissions.
//!
//! Producers enqueue fire-and-forget; records buffer per room and flush as
//! one batched segment write when the buffer reaches `batch_size`
//! (immediate) or the periodic tick fires (latency bound), whichever comes
//! first. Persisting one record per disk round-trip would serialize every
//! write behind the segment's queue key; batching amortizes that cost
//! while keeping per-room order.
//!
//! Flush is mutually exclusive per room: a trigger while one is in flight
//! is a no-op, and whatever buffered meanwhile is picked up when the
//! in-flight flush completes (size re-check) or on the next tick. After a
//! persistence failure the batch returns to the front of its room buffer
//! for the next attempt — at-least-once, order best-effort under repeated
//! failures. Producers never see persistence errors.
//!
//! Fan-out: after a batch is durable, the subscriber callback receives the
//! room key and the records in buffered order, exactly once per batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::future;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::StoreConfig;
use crate::records::Message;
use crate::segments::SegmentSet;

/// Invoked once per persisted batch: `(room_id, records)` in buffered
/// order. The transport layer uses this to push messages to connected
/// listeners of the room.
pub type BatchSubscriber = Arc<dyn Fn(&str, &[Message]) + Send + Sync>;

struct RoomBuffer {
    pending: Vec<Message>,
    /// Per-room flush lock: at most one in-flight flush.
    flushing: bool,
}

struct BatcherInner {
    log: Arc<SegmentSet>,
    config: Arc<StoreConfig>,
    buffers: Mutex<HashMap<String, RoomBuffer>>,
    subscriber: BatchSubscriber,
    closed: AtomicBool,
}

/// Per-room write batching in front of the segment log.
pub struct IngestBatcher {
    inner: Arc<BatcherInner>,
    shutdown: Arc<Notify>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl IngestBatcher {
    /// Start the batcher and its periodic flusher.
    pub fn new(log: Arc<SegmentSet>, config: Arc<StoreConfig>, subscriber: BatchSubscriber) -> Self {
        let inner = Arc::new(BatcherInner {
            log,
            config: Arc::clone(&config),
            buffers: Mutex::new(HashMap::new()),
            subscriber,
            closed: AtomicBool::new(false),
        });

        let shutdown = Arc::new(Notify::new());
        let ticker = Self::spawn_ticker(Arc::downgrade(&inner), config, Arc::clone(&shutdown));
        Self {
            inner,
            shutdown,
            ticker: Mutex::new(Some(ticker)),
        }
    }

    /// The ticker is stopped by signal, never by abort: a tick flush holds
    /// per-room flush flags across awaits, and cancelling it mid-flush
    /// would leak a flag (and lose the claimed batch). The shutdown check
    /// only happens between ticks, so a flush in progress always completes.
    fn spawn_ticker(
        weak: Weak<BatcherInner>,
        config: Arc<StoreConfig>,
        shutdown: Arc<Notify>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.flush_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tick.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.flush_all().await;
                    }
                }
            }
        })
    }

    /// Buffer one message for its room. Non-blocking; persistence is
    /// eventual and errors never reach the producer. Messages enqueued
    /// after `close()` are dropped with a warning.
    pub fn enqueue(&self, room_id: &str, message: Message) {
        if self.inner.closed.load(Ordering::SeqCst) {
            tracing::warn!("ingest enqueue after close dropped (room '{}')", room_id);
            return;
        }

        let batch = {
            let mut buffers = self.inner.buffers.lock().expect("buffer lock poisoned");
            let buf = buffers.entry(room_id.to_string()).or_insert_with(|| RoomBuffer {
                pending: Vec::new(),
                flushing: false,
            });
            buf.pending.push(message);
            if buf.pending.len() >= self.inner.config.batch_size && !buf.flushing {
                buf.flushing = true;
                let take = self.inner.config.batch_size.min(buf.pending.len());
                Some(buf.pending.drain(..take).collect::<Vec<_>>())
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            let inner = Arc::clone(&self.inner);
            let room = room_id.to_string();
            tokio::spawn(async move {
                BatcherInner::run_flush(inner, room, batch).await;
            });
        }
    }

    /// Force-flush every room buffer and wait for completion.
    pub async fn flush(&self) {
        self.inner.flush_all().await;
    }

    /// Number of messages currently buffered for a room.
    pub fn pending(&self, room_id: &str) -> usize {
        let buffers = self.inner.buffers.lock().expect("buffer lock poisoned");
        buffers.get(room_id).map(|b| b.pending.len()).unwrap_or(0)
    }

    /// Discard the room's buffer and wait for any in-flight flush to
    /// settle (used when the room is deleted). Returns only once no flush
    /// for this room can persist records anymore, so a purge that runs
    /// afterwards sees everything the batcher ever wrote.
    pub async fn drop_room(&self, room_id: &str) {
        let mut dropped = 0usize;
        loop {
            {
                let mut buffers = self.inner.buffers.lock().expect("buffer lock poisoned");
                if let Some(buf) = buffers.get_mut(room_id) {
                    dropped += buf.pending.len();
                    buf.pending.clear();
                    if !buf.flushing {
                        buffers.remove(room_id);
                        break;
                    }
                } else {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        if dropped > 0 {
            tracing::debug!("dropped {} buffered messages for deleted room '{}'", dropped, room_id);
        }
    }

    /// Stop the periodic flusher and flush everything still buffered.
    /// Idempotent. Buffers that fail to persist here are reported lost.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.ticker.lock().expect("ticker lock poisoned").take();
        if let Some(handle) = handle {
            // Let an in-flight tick flush finish; it holds flush flags.
            self.shutdown.notify_one();
            if let Err(e) = handle.await {
                tracing::warn!("flush ticker task failed: {}", e);
            }
        }
        self.inner.flush_all().await;

        let remaining: usize = {
            let buffers = self.inner.buffers.lock().expect("buffer lock poisoned");
            buffers.values().map(|b| b.pending.len()).sum()
        };
        if remaining > 0 {
            tracing::warn!("ingest close: {} buffered messages could not be persisted", remaining);
        }
    }
}

impl BatcherInner {
    /// Flush every room with a non-empty buffer and wait until no flush is
    /// in flight. Timer-path flushes drain the whole buffer (size-path
    /// flushes cap at `batch_size`; see `run_flush`).
    ///
    /// Size-triggered flushes run as detached tasks; rooms they hold are
    /// skipped here, so a second pass picks up whatever they left behind.
    /// Batches that fail twice stay buffered for the next tick.
    async fn flush_all(self: &Arc<Self>) {
        for _ in 0..2 {
            let rooms: Vec<String> = {
                let buffers = self.buffers.lock().expect("buffer lock poisoned");
                buffers
                    .iter()
                    .filter(|(_, b)| !b.pending.is_empty() && !b.flushing)
                    .map(|(room, _)| room.clone())
                    .collect()
            };

            let mut claimed = Vec::new();
            for room in rooms {
                let mut buffers = self.buffers.lock().expect("buffer lock poisoned");
                if let Some(buf) = buffers.get_mut(&room) {
                    if !buf.flushing && !buf.pending.is_empty() {
                        buf.flushing = true;
                        claimed.push((room, std::mem::take(&mut buf.pending)));
                    }
                }
            }

            // Rooms are independent; flush them concurrently.
            future::join_all(
                claimed
                    .into_iter()
                    .map(|(room, batch)| Self::run_flush(Arc::clone(self), room, batch)),
            )
            .await;

            self.wait_idle().await;

            let all_empty = {
                let buffers = self.buffers.lock().expect("buffer lock poisoned");
                buffers.values().all(|b| b.pending.is_empty())
            };
            if all_empty {
                break;
            }
        }
    }

    /// Wait for detached size-triggered flushes to finish.
    async fn wait_idle(&self) {
        loop {
            let busy = {
                let buffers = self.buffers.lock().expect("buffer lock poisoned");
                buffers.values().any(|b| b.flushing)
            };
            if !busy {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    /// Persist one batch, fan out, then re-check the size trigger while
    /// the room's flush lock is still held. Entered with `flushing`
    /// already set for `room`; clears it before returning.
    async fn run_flush(inner: Arc<Self>, room: String, mut batch: Vec<Message>) {
        loop {
            match inner.log.append_batch(batch.clone()).await {
                Ok(()) => {
                    (inner.subscriber)(&room, &batch);

                    let next = {
                        let mut buffers = inner.buffers.lock().expect("buffer lock poisoned");
                        let buf = buffers.get_mut(&room).expect("flushing room must exist");
                        if buf.pending.len() >= inner.config.batch_size {
                            let take = inner.config.batch_size;
                            Some(buf.pending.drain(..take).collect::<Vec<_>>())
                        } else {
                            buf.flushing = false;
                            None
                        }
                    };
                    match next {
                        Some(b) => batch = b,
                        None => return,
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "flush for room '{}' failed ({} records), requeued: {}",
                        room,
                        batch.len(),
                        e
                    );
                    let mut buffers = inner.buffers.lock().expect("buffer lock poisoned");
                    let buf = buffers.get_mut(&room).expect("flushing room must exist");
                    buf.pending.splice(0..0, batch);
                    buf.flushing = false;
                    return;
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
