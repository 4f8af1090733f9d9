//! Property-Based Tests for the Priority Queues
//!
//! # Test Properties
//!
//! 1. **Ordering**: dequeue order is non-increasing in priority
//! 2. **Stability**: equal priorities dequeue in enqueue order
//! 3. **Capacity**: overflowing a fixed queue never corrupts it
//! 4. **Freshness**: `update_priority` is reflected by the next dequeue

#![cfg(test)]

use proptest::prelude::*;

use super::{PriorityQueue, SimplePriorityQueue};

// =============================================================================
// Property Strategies
// =============================================================================

/// Small priority range so ties are common
fn priorities_strategy() -> impl Strategy<Value = Vec<i32>> {
    prop::collection::vec(-3i32..=3, 0..200)
}

// =============================================================================
// Ordering Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: priorities never increase and ties keep FIFO order.
    #[test]
    fn prop_dequeue_is_priority_then_fifo(priorities in priorities_strategy()) {
        let mut queue = SimplePriorityQueue::new();
        for (seq, priority) in priorities.iter().enumerate() {
            queue.enqueue(seq, *priority)?;
        }

        let mut previous: Option<(i32, usize)> = None;
        while let Some(seq) = queue.try_dequeue() {
            let priority = priorities[seq];
            if let Some((prev_priority, prev_seq)) = previous {
                prop_assert!(priority <= prev_priority);
                if priority == prev_priority {
                    prop_assert!(seq > prev_seq, "FIFO violated: {} after {}", seq, prev_seq);
                }
            }
            previous = Some((priority, seq));
        }
    }

    /// Property: enqueueing into a full queue fails and leaves it intact.
    #[test]
    fn prop_overflow_is_harmless(
        priorities in prop::collection::vec(-5i32..5, 1..20),
        extra in -5i32..5,
    ) {
        let mut queue = PriorityQueue::new(priorities.len())?;
        for (seq, priority) in priorities.iter().enumerate() {
            queue.enqueue(seq, *priority)?;
        }
        let mut reference = queue.clone();

        prop_assert!(queue.enqueue(usize::MAX, extra).is_err());
        prop_assert_eq!(queue.len(), priorities.len());

        while let Ok(expected) = reference.dequeue() {
            prop_assert_eq!(queue.dequeue()?, expected);
        }
        prop_assert!(queue.is_empty());
    }

    /// Property: after update_priority, first() matches a full re-sort.
    #[test]
    fn prop_update_priority_is_fresh(
        priorities in prop::collection::vec(-10i32..10, 1..50),
        target in any::<prop::sample::Index>(),
        new_priority in -20i32..20,
    ) {
        let mut queue = PriorityQueue::new(priorities.len())?;
        for (seq, priority) in priorities.iter().enumerate() {
            queue.enqueue(seq, *priority)?;
        }

        let target = target.index(priorities.len());
        queue.update_priority(&target, new_priority)?;

        let mut expected: Vec<(i32, usize)> = priorities
            .iter()
            .enumerate()
            .map(|(seq, p)| (if seq == target { new_priority } else { *p }, seq))
            .collect();
        expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, seq) in expected {
            prop_assert_eq!(queue.dequeue()?, seq);
        }
    }

    /// Property: removing arbitrary items keeps the rest ordered.
    #[test]
    fn prop_remove_keeps_heap_valid(
        priorities in prop::collection::vec(-10i32..10, 1..60),
        removals in prop::collection::vec(any::<prop::sample::Index>(), 0..20),
    ) {
        let mut queue = SimplePriorityQueue::new();
        for (seq, priority) in priorities.iter().enumerate() {
            queue.enqueue(seq, *priority)?;
        }
        for index in removals {
            queue.try_remove(&index.index(priorities.len()));
        }

        let mut last = i32::MAX;
        while let Some(seq) = queue.try_dequeue() {
            prop_assert!(priorities[seq] <= last);
            last = priorities[seq];
        }
    }
}
