//! Bounded ingestion queue between the broker task and the pipeline workers
//!
//! The producer side never waits: a full queue rejects the newest item and
//! bumps the drop counter. Consumers poll in small batches with a timeout
//! and get an empty batch back when nothing arrived, so the caller keeps
//! control of its loop.

use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Minimum gap between two "queue full" warnings
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Why an item was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("ingestion queue full (capacity {capacity}), item dropped")]
    QueueFull { capacity: usize },
    #[error("ingestion queue closed")]
    Closed,
}

pub struct IngestQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
    last_drop_warn: SyncMutex<Option<Instant>>,
}

impl<T> IngestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            last_drop_warn: SyncMutex::new(None),
        }
    }

    /// Non-blocking enqueue; drops `item` when the queue is full
    pub fn try_push(&self, item: T) -> Result<(), EnqueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.warn_dropped(total);
                Err(EnqueueError::QueueFull { capacity: self.capacity })
            }
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    #[cold]
    fn warn_dropped(&self, total: u64) {
        let mut last = self.last_drop_warn.lock();
        if last.map_or(true, |t| t.elapsed() >= DROP_WARN_INTERVAL) {
            warn!(capacity = %self.capacity, dropped_total = %total, "ingest_queue_full_dropping");
            *last = Some(Instant::now());
        }
    }

    /// Take up to `max` items, waiting at most `timeout` for the first one.
    ///
    /// Returns `Some(vec![])` on timeout and `None` once the queue is closed
    /// and fully drained.
    pub async fn poll_batch(&self, max: usize, timeout: Duration) -> Option<Vec<T>> {
        let mut rx = self.rx.lock().await;

        let first = match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(item)) => item,
            Ok(None) => return None,
            Err(_) => {
                return if self.closed.load(Ordering::Acquire) && rx.is_empty() {
                    None
                } else {
                    Some(Vec::new())
                };
            }
        };

        let mut batch = Vec::with_capacity(max.clamp(1, 64));
        batch.push(first);
        while batch.len() < max {
            match rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    /// Stop accepting new items; buffered items can still be drained
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.rx.lock().await.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Items currently buffered
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items dropped on overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_fifo_batching() {
        let queue = IngestQueue::new(10);
        for i in 0..5 {
            queue.try_push(i).unwrap();
        }
        assert_eq!(queue.len(), 5);

        let batch = queue.poll_batch(3, SHORT).await.unwrap();
        assert_eq!(batch, vec![0, 1, 2]);
        let batch = queue.poll_batch(10, SHORT).await.unwrap();
        assert_eq!(batch, vec![3, 4]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_overflow_drops_newest() {
        let queue = IngestQueue::new(2);
        queue.try_push("a").unwrap();
        queue.try_push("b").unwrap();
        assert_eq!(queue.try_push("c"), Err(EnqueueError::QueueFull { capacity: 2 }));
        assert_eq!(queue.try_push("d"), Err(EnqueueError::QueueFull { capacity: 2 }));
        assert_eq!(queue.dropped(), 2);

        // The oldest items survive
        let batch = queue.poll_batch(10, SHORT).await.unwrap();
        assert_eq!(batch, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_empty_poll_returns_empty_batch() {
        let queue: IngestQueue<u32> = IngestQueue::new(4);
        let start = Instant::now();
        let batch = queue.poll_batch(8, SHORT).await;
        assert_eq!(batch, Some(vec![]));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_close_rejects_and_drains() {
        let queue = IngestQueue::new(4);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        queue.close().await;

        assert_eq!(queue.try_push(3), Err(EnqueueError::Closed));
        assert_eq!(queue.poll_batch(10, SHORT).await, Some(vec![1, 2]));
        assert_eq!(queue.poll_batch(10, SHORT).await, None);
    }

    #[tokio::test]
    async fn test_concurrent_consumers_see_each_item_once() {
        let queue = Arc::new(IngestQueue::new(1000));
        for i in 0..500u32 {
            queue.try_push(i).unwrap();
        }
        queue.close().await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(batch) = q.poll_batch(16, SHORT).await {
                    seen.extend(batch);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..500).collect::<Vec<_>>());
    }
}
