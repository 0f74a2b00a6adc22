// packages/engine/src/observability/event_queue.rs
//! Bounded lock-free queue between event producers and the audit writer

use super::events::LifecycleEvent;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free MPMC queue of lifecycle events
///
/// A full queue rejects the event instead of blocking the caller.
#[derive(Debug)]
pub struct EventQueue {
    queue: ArrayQueue<LifecycleEvent>,
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking; the event comes back when the queue is full
    pub fn push(&self, event: LifecycleEvent) -> Result<(), LifecycleEvent> {
        match self.queue.push(event) {
            Ok(()) => {
                self.pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(event) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(event)
            }
        }
    }

    pub fn try_pop(&self) -> Option<LifecycleEvent> {
        let event = self.queue.pop()?;
        self.popped.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Move up to `max` events into `batch`, returning how many were moved
    pub fn drain_into(&self, batch: &mut Vec<LifecycleEvent>, max: usize) -> usize {
        let mut moved = 0;
        while moved < max {
            match self.try_pop() {
                Some(event) => {
                    batch.push(event);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            len: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    /// Events rejected because the queue was full
    pub dropped: u64,
    pub len: usize,
    pub capacity: usize,
}

impl QueueStats {
    pub fn fill_ratio(&self) -> f64 {
        self.len as f64 / self.capacity as f64
    }

    /// Fraction of offered events that were dropped
    pub fn drop_rate(&self) -> f64 {
        let offered = self.pushed + self.dropped;
        if offered == 0 {
            0.0
        } else {
            self.dropped as f64 / offered as f64
        }
    }
}
