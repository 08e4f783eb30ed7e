//! FIFO ready queue for node drivers.
//!
//! The queue holds the ids of drivers that are ready to be polled. Entries
//! are deduplicated, so waking a driver that is already queued is a no-op.
//! When the queue runs dry the runner parks on the queue's condvar; wakes
//! arriving from other threads (completion callbacks, the panic hook) notify
//! it.

use crate::types::TestId;
use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex};

/// A FIFO queue of ready drivers with dedup and parking.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    inner: Mutex<QueueInner>,
    condvar: Condvar,
}

#[derive(Debug, Default)]
struct QueueInner {
    queue: VecDeque<TestId>,
    scheduled: HashSet<TestId>,
}

impl ReadyQueue {
    /// Creates an empty queue.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedules a driver. Does nothing if it is already queued.
    pub(crate) fn schedule(&self, id: TestId) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.scheduled.insert(id) {
            inner.queue.push_back(id);
            self.condvar.notify_one();
        }
    }

    /// Pops the next ready driver.
    pub(crate) fn pop(&self) -> Option<TestId> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let id = inner.queue.pop_front()?;
        inner.scheduled.remove(&id);
        Some(id)
    }

    /// Returns the number of queued drivers.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").queue.len()
    }

    /// Blocks until at least one driver is queued.
    pub(crate) fn park(&self) {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let _unused = self
            .condvar
            .wait_while(inner, |inner| inner.queue.is_empty())
            .expect("queue lock poisoned");
    }
}
