//! Bounded frame queue
//!
//! Hand-off point between a session's output pump and its sender. Pushing never
//! waits: when the queue is full the oldest entry is dropped to make room.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::value::RawValue;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Queue of serialized output frames.
pub type FrameQueue = BoundedQueue<Box<RawValue>>;

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    available: Notify,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Insert an item, evicting the oldest one if the queue is full.
    ///
    /// Returns `true` when an item was evicted.
    pub fn push(&self, item: T) -> bool {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front();
                true
            } else {
                false
            };
            items.push_back(item);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.available.notify_one();
        evicted
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Pop the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// A zero timeout does not wait.
    pub async fn poll(&self, timeout: Duration) -> Option<T> {
        if timeout.is_zero() {
            return self.try_pop();
        }
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
