//! Growable priority queue
//!
//! Same ordering rules as [`PriorityQueue`], without a fixed capacity, plus
//! non-failing `try_*` accessors for callers that treat "empty" as normal.

use std::hash::Hash;

use super::fixed::PriorityQueue;
use crate::error::{Error, Result};

const INITIAL_CAPACITY: usize = 16;

/// Priority queue that doubles its capacity instead of rejecting inserts
#[derive(Debug, Clone)]
pub struct SimplePriorityQueue<T> {
    inner: PriorityQueue<T>,
}

impl<T: Eq + Hash + Clone> Default for SimplePriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Clone> SimplePriorityQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            inner: Self::fresh(),
        }
    }

    fn fresh() -> PriorityQueue<T> {
        PriorityQueue::with_max_size(INITIAL_CAPACITY)
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// O(1) membership test
    pub fn contains(&self, item: &T) -> bool {
        self.inner.contains(item)
    }

    /// Insert an item, growing the backing storage when full
    ///
    /// Fails only if the item is already queued.
    pub fn enqueue(&mut self, item: T, priority: i32) -> Result<()> {
        if self.inner.is_full() {
            let grown = self.inner.max_size().saturating_mul(2);
            self.inner.resize(grown)?;
        }
        self.inner.enqueue(item, priority)
    }

    /// Remove and return the highest-priority item
    pub fn dequeue(&mut self) -> Result<T> {
        self.inner.dequeue()
    }

    /// Remove and return the highest-priority item, if any
    pub fn try_dequeue(&mut self) -> Option<T> {
        self.inner.dequeue().ok()
    }

    /// Peek at the highest-priority item
    pub fn first(&self) -> Result<&T> {
        self.inner.first()
    }

    /// Peek at the highest-priority item, if any
    pub fn try_first(&self) -> Option<&T> {
        self.inner.first().ok()
    }

    /// Reposition an existing item under a new priority
    pub fn update_priority(&mut self, item: &T, priority: i32) -> Result<()> {
        self.inner.update_priority(item, priority)
    }

    /// Remove an item from anywhere in the queue
    pub fn remove(&mut self, item: &T) -> Result<T> {
        self.inner.remove(item)
    }

    /// Remove an item if present, returning whether it was queued
    pub fn try_remove(&mut self, item: &T) -> bool {
        !matches!(self.inner.remove(item), Err(Error::ItemNotFound))
    }

    /// Remove all items and release grown storage
    pub fn clear(&mut self) {
        self.inner = Self::fresh();
    }

    /// Remove all items, returning them in dequeue order
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.inner.len());
        while let Some(item) = self.try_dequeue() {
            items.push(item);
        }
        self.clear();
        items
    }

    /// Iterate over queued items and priorities in heap order
    pub fn iter(&self) -> impl Iterator<Item = (&T, i32)> {
        self.inner.iter()
    }
}

// =============================================================================
// Tests
// =============================================================================
