//! MessageQueue (C5): a thread-safe FIFO-with-priority queue holding
//! inbound user messages while a cognition service is not ACTIVE, with
//! edge-triggered wake signaling.
//!
//! Ordering is total: descending priority, then ascending enqueue order.
//! Exactly one `wake_needed` event fires per empty→nonempty transition —
//! not once per enqueue — so a burst of messages arriving while the
//! sleep manager is already waking doesn't re-trigger it.

#![forbid(unsafe_code)]

use gaia_proto::QueuedMessage;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock};

/// Receives the edge-triggered wake signal. Called synchronously while
/// the queue's lock is not held, so implementations may themselves touch
/// the queue (e.g. to dequeue immediately) without deadlocking.
pub trait WakeReceiver: Send + Sync {
    fn wake_needed(&self);
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub size: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
}

struct Entry {
    priority: i32,
    seq: u64,
    msg: QueuedMessage,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority pops first; for equal
        // priority, the *lower* sequence number (earlier arrival) must
        // pop first, so we invert the seq comparison.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    wake_signalled: bool,
    stats: QueueStats,
}

pub struct MessageQueue {
    inner: Mutex<Inner>,
    receiver: OnceLock<Arc<dyn WakeReceiver>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                wake_signalled: false,
                stats: QueueStats::default(),
            }),
            receiver: OnceLock::new(),
        }
    }

    pub fn with_receiver(receiver: Arc<dyn WakeReceiver>) -> Self {
        let queue = Self::new();
        queue.bind_receiver(receiver);
        queue
    }

    /// Late-binds the wake receiver after construction, for callers whose
    /// receiver itself needs an `Arc<MessageQueue>` to exist first (e.g. a
    /// bridge wrapping the manager this queue belongs to). A no-op if a
    /// receiver is already bound.
    pub fn bind_receiver(&self, receiver: Arc<dyn WakeReceiver>) {
        let _ = self.receiver.set(receiver);
    }

    /// Atomically appends `msg`. Returns `true` if this call produced the
    /// empty→nonempty edge (and thus fired `wake_needed`).
    pub fn enqueue(&self, msg: QueuedMessage) -> bool {
        let fired = {
            let mut inner = self.inner.lock();
            let was_empty = inner.heap.is_empty();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Entry { priority: msg.priority, seq, msg });
            inner.stats.size = inner.heap.len();
            inner.stats.total_enqueued += 1;
            if was_empty && !inner.wake_signalled {
                inner.wake_signalled = true;
                true
            } else {
                false
            }
        };
        if fired {
            if let Some(recv) = self.receiver.get() {
                recv.wake_needed();
            }
        }
        fired
    }

    /// Removes and returns the highest-priority, oldest message. Clears
    /// the wake-signalled flag if this dequeue empties the queue.
    pub fn dequeue(&self) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock();
        let entry = inner.heap.pop();
        if let Some(entry) = &entry {
            inner.stats.size = inner.heap.len();
            inner.stats.total_dequeued += 1;
            let _ = entry;
        }
        if inner.heap.is_empty() {
            inner.wake_signalled = false;
        }
        entry.map(|e| e.msg)
    }

    pub fn peek(&self) -> Option<QueuedMessage> {
        self.inner.lock().heap.peek().map(|e| e.msg.clone())
    }

    pub fn size(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats.clone()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}
