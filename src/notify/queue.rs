//! Ordered, bounded event dispatch queue.
//!
//! One queue per store, one consumer (the dispatch loop). Enqueueing
//! itself never blocks and happens while the mutation lock is held, so
//! enqueue order equals mutation order. Backpressure is applied to
//! producers *before* they take the mutation lock: [`EventQueue::reserve`]
//! waits until the queue is below its soft capacity. The dispatch thread
//! is exempt from the gate so listener callbacks can write back into the
//! store without deadlocking against the only consumer; such writes may
//! momentarily overshoot the capacity.

use super::EntryEvent;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::thread::ThreadId;

struct QueueInner {
    events: VecDeque<(u64, EntryEvent)>,
    /// Stamp of the most recently enqueued event, starting at 0.
    stamp: u64,
    shutdown: bool,
    dispatch_thread: Option<ThreadId>,
}

/// Single-consumer event queue with producer backpressure.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl EventQueue {
    /// Create a queue with the given soft capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                events: VecDeque::new(),
                stamp: 0,
                shutdown: false,
                dispatch_thread: None,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Record the calling thread as the dispatch consumer.
    pub fn register_dispatch_thread(&self) {
        self.inner.lock().dispatch_thread = Some(std::thread::current().id());
    }

    /// Wait until the queue has room for another event.
    ///
    /// Called by producers before taking the mutation lock. Returns
    /// immediately on the dispatch thread or after shutdown.
    pub fn reserve(&self) {
        let mut inner = self.inner.lock();
        if inner.dispatch_thread == Some(std::thread::current().id()) {
            return;
        }
        while inner.events.len() >= self.capacity && !inner.shutdown {
            self.not_full.wait(&mut inner);
        }
    }

    /// Append an event, stamping it with the next enqueue number. Never
    /// blocks; events pushed after shutdown are discarded.
    pub fn push(&self, event: EntryEvent) {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return;
        }
        inner.stamp += 1;
        let stamp = inner.stamp;
        inner.events.push_back((stamp, event));
        self.not_empty.notify_one();
    }

    /// Stamp of the most recently enqueued event. Every event stamped at
    /// or below this value has already been enqueued; called under the
    /// store's mutation lock this is a registration watermark no later
    /// push can fall behind.
    pub fn stamp(&self) -> u64 {
        self.inner.lock().stamp
    }

    /// Pop the next event in enqueue order, waiting if the queue is
    /// empty. Returns None once the queue is shut down and drained.
    pub fn pop(&self) -> Option<(u64, EntryEvent)> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(stamped) = inner.events.pop_front() {
                self.not_full.notify_one();
                return Some(stamped);
            }
            if inner.shutdown {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Shut the queue down, waking every blocked producer and the
    /// consumer. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
