//! Per-key serialization of mutating operations.
//!
//! `ResourceQueue` guarantees that for a fixed key, operations submitted in
//! call order execute in that order with at most one in flight. Operations
//! for different keys run independently.
//!
//! Each key gets a dedicated worker task fed by an unbounded channel. The
//! caller's outcome travels through a per-call oneshot, so a failed
//! operation is delivered to its own caller while the worker moves on to
//! the next job. "Slot is free" and "caller's result" are deliberately
//! separate channels: gating the next operation on the previous result
//! would stall the key forever after one failure.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, StoreError};

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct Worker {
    tx: mpsc::UnboundedSender<Job>,
    handle: JoinHandle<()>,
}

/// FIFO operation queues keyed by logical resource (one per collection
/// file). Constructed once per store; no ambient registry.
pub struct ResourceQueue {
    /// `None` after `close()` — further submissions are rejected.
    workers: Mutex<Option<HashMap<String, Worker>>>,
}

impl ResourceQueue {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Run `op` after all previously submitted operations for `key` have
    /// completed (successfully or not). Returns `op`'s own outcome.
    ///
    /// Submission order is fixed while holding the registry lock, so two
    /// callers that race on `run` for the same key execute in the order
    /// their submissions landed.
    pub async fn run<T, F>(&self, key: &str, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();

        let job: Job = Box::new(move || {
            Box::pin(async move {
                let outcome = op.await;
                // Caller may have been dropped; the slot frees regardless.
                let _ = result_tx.send(outcome);
            })
        });

        {
            let mut guard = self.workers.lock().expect("queue registry poisoned");
            let map = guard.as_mut().ok_or(StoreError::ShuttingDown)?;
            let worker = map
                .entry(key.to_string())
                .or_insert_with(|| Self::spawn_worker(key));
            worker
                .tx
                .send(job)
                .map_err(|_| StoreError::QueueClosed(key.to_string()))?;
        }

        result_rx
            .await
            .map_err(|_| StoreError::QueueClosed(key.to_string()))?
    }

    fn spawn_worker(key: &str) -> Worker {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker_key = key.to_string();
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job().await;
            }
            tracing::debug!("resource queue worker for '{}' drained", worker_key);
        });
        Worker { tx, handle }
    }

    /// Shut down: reject new submissions, let every worker drain its
    /// already-queued jobs, then wait for them to finish. Idempotent.
    pub async fn close(&self) {
        let taken = {
            let mut guard = self.workers.lock().expect("queue registry poisoned");
            guard.take()
        };
        let Some(map) = taken else { return };
        for (_, worker) in map {
            drop(worker.tx);
            if let Err(e) = worker.handle.await {
                if !e.is_cancelled() {
                    tracing::warn!("resource queue worker panicked: {}", e);
                }
            }
        }
    }
}

impl Default for ResourceQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_single_op_returns_result() {
        let queue = ResourceQueue::new();
        let out = queue.run("k", async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_submission_order_preserved() {
        let queue = Arc::new(ResourceQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        // Submit sequentially (call order defines the contract), but let
        // each op yield so overlapping execution would scramble the log.
        let mut handles = Vec::new();
        for i in 0..100usize {
            let log = Arc::clone(&log);
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue
                    .run("k", async move {
                        tokio::task::yield_now().await;
                        log.lock().unwrap().push(i);
                        Ok(())
                    })
                    .await
            }));
            // Registration happens when the spawned task first polls
            // run() — yield so task i registers before task i+1 spawns.
            tokio::task::yield_now().await;
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let seen = log.lock().unwrap().clone();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_same_key_never_overlaps() {
        let queue = Arc::new(ResourceQueue::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue
                    .run("k", async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_does_not_stall_key() {
        let queue = ResourceQueue::new();

        let err = queue
            .run("k", async {
                Err::<(), _>(StoreError::RoomNotFound("r1".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RoomNotFound(_)));

        // The failed slot must still free: the next operation runs.
        let out = queue.run("k", async { Ok("still alive") }).await.unwrap();
        assert_eq!(out, "still alive");
    }

    #[tokio::test]
    async fn test_many_failures_then_success() {
        let queue = ResourceQueue::new();
        for _ in 0..10 {
            let _ = queue
                .run("k", async { Err::<(), _>(StoreError::ShuttingDown) })
                .await;
        }
        assert_eq!(queue.run("k", async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_independent_keys_run_concurrently() {
        let queue = Arc::new(ResourceQueue::new());
        let gate = Arc::new(Notify::new());

        // Op on key "a" blocks until key "b"'s op releases it. If keys
        // shared one lane this would deadlock (timeout guards the test).
        let gate_a = Arc::clone(&gate);
        let queue_a = Arc::clone(&queue);
        let a = tokio::spawn(async move {
            queue_a
                .run("a", async move {
                    gate_a.notified().await;
                    Ok(())
                })
                .await
        });

        tokio::task::yield_now().await;

        let gate_b = Arc::clone(&gate);
        let queue_b = Arc::clone(&queue);
        let b = tokio::spawn(async move {
            queue_b
                .run("b", async move {
                    gate_b.notify_one();
                    Ok(())
                })
                .await
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            a.await.unwrap().unwrap();
            b.await.unwrap().unwrap();
        })
        .await
        .expect("cross-key operations must not serialize against each other");
    }

    #[tokio::test]
    async fn test_run_after_close_rejected() {
        let queue = ResourceQueue::new();
        queue.run("k", async { Ok(()) }).await.unwrap();
        queue.close().await;

        let err = queue.run("k", async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, StoreError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_close_drains_queued_jobs() {
        let queue = Arc::new(ResourceQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue
                    .run("k", async move {
                        tokio::task::yield_now().await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        // Give every submission a chance to land before closing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await;

        for h in handles {
            // Jobs either ran before close registered them or completed
            // during the drain; none may be silently dropped mid-queue.
            let _ = h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let queue = ResourceQueue::new();
        queue.close().await;
        queue.close().await;
    }
}
