//! Fixed-capacity indexed priority queue
//!
//! Binary max-heap over `(priority, insertion)` with a side index from item
//! to heap slot, giving O(1) `contains` and O(log n) `update_priority` and
//! `remove`.

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::{Error, Result};

/// Heap slot: the user item plus its ordering keys
#[derive(Debug, Clone)]
struct Node<T> {
    item: T,
    priority: i32,
    /// Monotonic counter, lower = enqueued earlier
    insertion: u64,
}

impl<T> Node<T> {
    /// True when `self` must dequeue before `other`
    #[inline]
    fn outranks(&self, other: &Node<T>) -> bool {
        self.priority > other.priority
            || (self.priority == other.priority && self.insertion < other.insertion)
    }
}

/// Priority queue with a fixed maximum size
///
/// Higher priorities dequeue first; equal priorities dequeue in FIFO order.
/// Items are identified by `Eq + Hash`, so each item may be queued once.
#[derive(Debug, Clone)]
pub struct PriorityQueue<T> {
    nodes: Vec<Node<T>>,
    positions: HashMap<T, usize>,
    max_size: usize,
    next_insertion: u64,
}

impl<T: Eq + Hash + Clone> PriorityQueue<T> {
    /// Create a queue holding at most `max_size` items
    pub fn new(max_size: usize) -> Result<Self> {
        if max_size == 0 {
            return Err(Error::InvalidCapacity {
                requested: 0,
                count: 0,
            });
        }
        Ok(Self::with_max_size(max_size))
    }

    /// Infallible constructor for callers that guarantee a non-zero size
    pub(super) fn with_max_size(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            nodes: Vec::with_capacity(max_size),
            positions: HashMap::with_capacity(max_size),
            max_size,
            next_insertion: 0,
        }
    }

    /// Number of queued items
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the queue is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Maximum number of items the queue accepts
    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Check if the queue is at capacity
    #[inline]
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.max_size
    }

    /// O(1) membership test
    pub fn contains(&self, item: &T) -> bool {
        self.positions.contains_key(item)
    }

    /// Insert an item with the given priority
    pub fn enqueue(&mut self, item: T, priority: i32) -> Result<()> {
        if self.is_full() {
            return Err(Error::QueueFull {
                capacity: self.max_size,
            });
        }
        if self.positions.contains_key(&item) {
            return Err(Error::DuplicateItem);
        }

        let index = self.nodes.len();
        self.positions.insert(item.clone(), index);
        self.nodes.push(Node {
            item,
            priority,
            insertion: self.next_insertion,
        });
        self.next_insertion += 1;
        self.sift_up(index);
        Ok(())
    }

    /// Remove and return the highest-priority item
    pub fn dequeue(&mut self) -> Result<T> {
        self.remove_at(0).ok_or(Error::QueueEmpty)
    }

    /// Peek at the highest-priority item
    pub fn first(&self) -> Result<&T> {
        self.nodes
            .first()
            .map(|node| &node.item)
            .ok_or(Error::QueueEmpty)
    }

    /// Priority of the highest-priority item
    pub fn first_priority(&self) -> Result<i32> {
        self.nodes
            .first()
            .map(|node| node.priority)
            .ok_or(Error::QueueEmpty)
    }

    /// Current priority of a queued item
    pub fn priority_of(&self, item: &T) -> Result<i32> {
        let index = self.index_of(item)?;
        Ok(self.nodes[index].priority)
    }

    /// Reposition an existing item under a new priority
    ///
    /// The item keeps its original insertion order for tie-breaking.
    pub fn update_priority(&mut self, item: &T, priority: i32) -> Result<()> {
        let index = self.index_of(item)?;
        let old = self.nodes[index].priority;
        self.nodes[index].priority = priority;
        if priority > old {
            self.sift_up(index);
        } else if priority < old {
            self.sift_down(index);
        }
        Ok(())
    }

    /// Remove an item from anywhere in the queue
    pub fn remove(&mut self, item: &T) -> Result<T> {
        let index = self.index_of(item)?;
        self.remove_at(index).ok_or(Error::ItemNotFound)
    }

    /// Change the maximum size
    pub fn resize(&mut self, max_size: usize) -> Result<()> {
        if max_size == 0 || max_size < self.nodes.len() {
            return Err(Error::InvalidCapacity {
                requested: max_size,
                count: self.nodes.len(),
            });
        }
        if max_size > self.nodes.capacity() {
            self.nodes.reserve_exact(max_size - self.nodes.len());
        } else {
            self.nodes.shrink_to(max_size);
        }
        self.max_size = max_size;
        Ok(())
    }

    /// Remove all items
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.positions.clear();
    }

    /// Iterate over queued items and priorities in heap (not dequeue) order
    pub fn iter(&self) -> impl Iterator<Item = (&T, i32)> {
        self.nodes.iter().map(|node| (&node.item, node.priority))
    }

    fn index_of(&self, item: &T) -> Result<usize> {
        self.positions.get(item).copied().ok_or(Error::ItemNotFound)
    }

    fn remove_at(&mut self, index: usize) -> Option<T> {
        let last = self.nodes.len().checked_sub(1)?;
        if index > last {
            return None;
        }
        self.swap(index, last);
        let node = self.nodes.pop()?;
        self.positions.remove(&node.item);

        if index < self.nodes.len() {
            // The moved node may belong above or below its new slot
            if index > 0 && self.nodes[index].outranks(&self.nodes[(index - 1) / 2]) {
                self.sift_up(index);
            } else {
                self.sift_down(index);
            }
        }
        Some(node.item)
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.nodes[index].outranks(&self.nodes[parent]) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.nodes.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut best = index;

            if left < len && self.nodes[left].outranks(&self.nodes[best]) {
                best = left;
            }
            if right < len && self.nodes[right].outranks(&self.nodes[best]) {
                best = right;
            }
            if best == index {
                break;
            }
            self.swap(index, best);
            index = best;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.nodes.swap(a, b);
        if let Some(slot) = self.positions.get_mut(&self.nodes[a].item) {
            *slot = a;
        }
        if let Some(slot) = self.positions.get_mut(&self.nodes[b].item) {
            *slot = b;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
