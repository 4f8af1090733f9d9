//! Priority Queues
//!
//! Ordering structures for pending load requests.
//!
//! - [`PriorityQueue`]: fixed maximum size, fails when full
//! - [`SimplePriorityQueue`]: grows on demand, adds non-failing `try_*` calls
//!
//! Both are binary max-heaps: the highest priority dequeues first and equal
//! priorities dequeue in the order they were enqueued. All mutating
//! operations are O(log n); `first` and `contains` are O(1).
//!
//! Neither type synchronizes internally; owners wrap them in their own lock.

mod fixed;
mod proptest;
mod simple;

pub use fixed::PriorityQueue;
pub use simple::SimplePriorityQueue;
