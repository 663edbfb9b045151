//! Bounded FIFO with drop-oldest overflow
//!
//! `push` never blocks and never fails. When the buffer is full the single
//! oldest element is evicted before the new one is admitted, so the buffer
//! always holds the most recent `capacity` items in arrival order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Fewer elements are buffered than were requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Not enough data: requested {requested}, available {available}")]
pub struct NotEnoughData {
    pub requested: usize,
    pub available: usize,
}

/// Thread-safe bounded ring buffer
#[derive(Debug)]
pub struct RingBuffer<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl<T> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panic while holding the lock cannot leave the deque half-updated
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, evicting the oldest one if the buffer is full
    ///
    /// Returns the evicted item, if any.
    pub fn push(&self, item: T) -> Option<T> {
        let mut items = self.lock();
        let evicted = if items.len() >= self.capacity {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        evicted
    }

    /// Remove and return the `n` most recent items in arrival order
    ///
    /// Older items stay in the buffer untouched.
    pub fn drain(&self, n: usize) -> Result<Vec<T>, NotEnoughData> {
        let mut items = self.lock();
        if items.len() < n {
            return Err(NotEnoughData {
                requested: n,
                available: items.len(),
            });
        }
        let start = items.len() - n;
        Ok(items.drain(start..).collect())
    }

    /// Remove and return the oldest item
    pub fn pop_oldest(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of items dropped by overflow since creation
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copy the `n` most recent items in arrival order without removing them
    pub fn snapshot(&self, n: usize) -> Result<Vec<T>, NotEnoughData> {
        let items = self.lock();
        if items.len() < n {
            return Err(NotEnoughData {
                requested: n,
                available: items.len(),
            });
        }
        Ok(items.iter().skip(items.len() - n).cloned().collect())
    }

    /// Copy up to `n` of the most recent items in arrival order
    pub fn latest(&self, n: usize) -> Vec<T> {
        let items = self.lock();
        let skip = items.len().saturating_sub(n);
        items.iter().skip(skip).cloned().collect()
    }
}
