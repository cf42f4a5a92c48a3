//! Live-update hand-off between transaction threads and a populator.
//!
//! FIFO: updates are drained in the order they were pushed. Writers only
//! block while the queue is at capacity; once the populator seals the queue
//! every push hands its update straight back so the caller can route it to
//! the online index instead.

use crate::update::IndexEntryUpdate;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;

const BACKPRESSURE_WARN_INTERVAL: Duration = Duration::from_millis(500);

struct QueueInner {
    updates: VecDeque<IndexEntryUpdate>,
    closed: bool,
}

pub struct IndexUpdateQueue {
    inner: Mutex<QueueInner>,
    not_full: Condvar,
    capacity: usize,
}

impl IndexUpdateQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner { updates: VecDeque::new(), closed: false }),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue an update. Returns the update back if the queue is sealed.
    pub fn push(&self, update: IndexEntryUpdate) -> Result<(), IndexEntryUpdate> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(update);
            }
            if inner.updates.len() < self.capacity {
                inner.updates.push_back(update);
                return Ok(());
            }
            let timed_out = self.not_full.wait_for(&mut inner, BACKPRESSURE_WARN_INTERVAL).timed_out();
            if timed_out && !inner.closed && inner.updates.len() >= self.capacity {
                warn!(capacity = self.capacity, "index update queue full, writer slowed down");
            }
        }
    }

    /// Take every queued update in FIFO order without blocking.
    pub fn drain(&self) -> Vec<IndexEntryUpdate> {
        let drained: Vec<_> = self.inner.lock().updates.drain(..).collect();
        if !drained.is_empty() {
            self.not_full.notify_all();
        }
        drained
    }

    /// Seal the queue and take what is left. Later pushes are rejected.
    pub fn close_and_drain(&self) -> Vec<IndexEntryUpdate> {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.updates.drain(..).collect()
        };
        self.not_full.notify_all();
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().updates.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
