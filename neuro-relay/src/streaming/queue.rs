//! Bounded drop-newest queue
//!
//! One queue per source, on both the broker and the client side. A full
//! queue never blocks the producer: the incoming item is dropped and
//! counted, so a slow consumer costs completeness, never freshness of the
//! producer loop.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Minimum spacing between two drop warnings for the same queue
pub const DROP_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of [`BoundedQueue::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Put {
    Queued,
    /// Queue was full; the item was discarded
    Dropped,
}

/// Fixed-capacity FIFO shared between one producer and its consumer(s)
///
/// Cloning yields another handle to the same queue.
pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue without blocking, dropping `item` if the queue is full
    pub fn put(&self, item: T) -> Put {
        match self.tx.try_send(item) {
            Ok(()) => Put::Queued,
            // We hold a receiver ourselves, so Disconnected cannot happen
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Put::Dropped
            }
        }
    }

    /// Dequeue, waiting at most `timeout`; `None` on timeout
    pub fn get(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Dequeue without waiting
    pub fn try_get(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Receiving end, for use with `crossbeam_channel::Select`
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }

    /// Total number of items dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Rate-limits drop warnings
///
/// Feed it the queue's cumulative drop counter after a failed `put`; it
/// returns the number of drops since the last report once per interval.
#[derive(Debug)]
pub struct DropMonitor {
    reported: u64,
    last_report: Option<Instant>,
    interval: Duration,
}

impl Default for DropMonitor {
    fn default() -> Self {
        Self::new(DROP_REPORT_INTERVAL)
    }
}

impl DropMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            reported: 0,
            last_report: None,
            interval,
        }
    }

    /// Drops not yet reported, if a report is due
    pub fn due(&mut self, total_dropped: u64) -> Option<u64> {
        let pending = total_dropped.saturating_sub(self.reported);
        if pending == 0 {
            return None;
        }
        let now = Instant::now();
        if self
            .last_report
            .is_some_and(|last| now.duration_since(last) < self.interval)
        {
            return None;
        }
        self.last_report = Some(now);
        self.reported = total_dropped;
        Some(pending)
    }
}
