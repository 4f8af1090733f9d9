//! WorkScheduler implementation
//!
//! Pending leaders live in a [`SimplePriorityQueue`]; the per-key in-flight
//! map lives in a separate `DashMap` so completion can be signalled from any
//! drop site without touching the queue lock.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use super::{CacheResult, LoadTask, SchedulerConfig, SchedulerSignals};
use crate::error::{Error, Result};
use crate::is_valid_key;
use crate::queue::SimplePriorityQueue;

/// Task handle shared between callers and the scheduler
pub type SharedTask = Arc<dyn LoadTask>;

fn same_task(a: &SharedTask, b: &SharedTask) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// =============================================================================
// In-Flight Tracking
// =============================================================================

struct Flight {
    id: u64,
    done: watch::Receiver<bool>,
}

/// Frees the key's in-flight slot and wakes followers when dropped
struct CompletionGuard {
    key: String,
    id: u64,
    tx: watch::Sender<bool>,
    in_flight: Arc<DashMap<String, Flight>>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(&self.key, |_, flight| flight.id == self.id);
        self.tx.send_replace(true);
    }
}

enum Registration {
    Leader {
        guard: CompletionGuard,
        done: watch::Receiver<bool>,
    },
    Follower(watch::Receiver<bool>),
}

/// Queued leader; the completion guard fires once the last clone is gone
#[derive(Clone)]
struct Pending {
    id: u64,
    task: SharedTask,
    _completion: Arc<CompletionGuard>,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Pending {}

impl Hash for Pending {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Scheduler statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub in_flight_keys: usize,
    pub running: usize,
    pub max_parallel_tasks: usize,
    pub submitted: u64,
    pub cache_hits: u64,
    pub deduplicated: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub paused: bool,
    pub exit_tasks_early: bool,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    cache_hits: AtomicU64,
    deduplicated: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Decrements the running count even if the task panics
struct RunningSlot<'a>(&'a AtomicUsize);

impl<'a> RunningSlot<'a> {
    fn enter(running: &'a AtomicUsize) -> Self {
        running.fetch_add(1, Ordering::Relaxed);
        Self(running)
    }
}

impl Drop for RunningSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Scheduler
// =============================================================================

struct State {
    queue: SimplePriorityQueue<Pending>,
    dispatching: bool,
}

struct Inner {
    state: Mutex<State>,
    in_flight: Arc<DashMap<String, Flight>>,
    signals: SchedulerSignals,
    max_parallel: AtomicUsize,
    next_id: AtomicU64,
    running: AtomicUsize,
    counters: Counters,
}

/// Deduplicating, priority-ordered, concurrency-capped task runner
#[derive(Clone)]
pub struct WorkScheduler {
    inner: Arc<Inner>,
}

impl Default for WorkScheduler {
    fn default() -> Self {
        Self::new(&SchedulerConfig::default())
    }
}

impl WorkScheduler {
    /// Create a new scheduler
    pub fn new(config: &SchedulerConfig) -> Self {
        let max_parallel = config.resolved_max_parallel_tasks();
        debug!(max_parallel, "Creating work scheduler");
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: SimplePriorityQueue::new(),
                    dispatching: false,
                }),
                in_flight: Arc::new(DashMap::new()),
                signals: SchedulerSignals::default(),
                max_parallel: AtomicUsize::new(max_parallel),
                next_id: AtomicU64::new(0),
                running: AtomicUsize::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Get flags tasks consult at their checkpoints
    pub fn signals(&self) -> SchedulerSignals {
        self.inner.signals.clone()
    }

    /// Get the concurrency cap
    pub fn max_parallel_tasks(&self) -> usize {
        self.inner.max_parallel.load(Ordering::Relaxed)
    }

    /// Change the concurrency cap; applies from the next dispatch batch
    pub fn set_max_parallel_tasks(&self, max: usize) {
        self.inner.max_parallel.store(max.max(1), Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.signals.is_paused()
    }

    pub fn exit_tasks_early(&self) -> bool {
        self.inner.signals.exit_tasks_early()
    }

    /// Number of queued (not yet running) leaders
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Check whether a load for `key` is queued or running
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.in_flight.contains_key(key)
    }

    /// Submit a load on a background task
    ///
    /// Key validation happens before spawning so an invalid key fails here.
    pub fn load_image(&self, task: SharedTask) -> Result<JoinHandle<Result<()>>> {
        if !is_valid_key(task.key()) {
            error!("Rejected load with empty cache key");
            return Err(Error::InvalidKey);
        }
        let scheduler = self.clone();
        Ok(tokio::spawn(
            async move { scheduler.load_image_async(task).await },
        ))
    }

    /// Submit a load and wait until this request is resolved
    ///
    /// Resolves after a cache hit, after the task (or the leader it followed)
    /// finished, or once the request was dropped by cancellation or pause.
    #[instrument(skip(self, task), fields(key = %task.key()))]
    pub async fn load_image_async(&self, task: SharedTask) -> Result<()> {
        if !is_valid_key(task.key()) {
            error!("Rejected load with empty cache key");
            return Err(Error::InvalidKey);
        }
        if task.is_cancelled() {
            debug!("Task already cancelled");
            return Ok(());
        }
        Counters::bump(&self.inner.counters.submitted, 1);

        if self.served_from_cache(&task).await {
            return Ok(());
        }
        if self.should_abandon(&task) {
            debug!("Not scheduling: cancelled, paused or exiting");
            return Ok(());
        }

        task.prepare();

        loop {
            match self.inner.register(task.key()) {
                Registration::Leader { guard, mut done } => {
                    if !self.inner.enqueue(Arc::clone(&task), guard) {
                        return Ok(());
                    }
                    let _ = done.wait_for(|finished| *finished).await;
                    return Ok(());
                }
                Registration::Follower(mut done) => {
                    Counters::bump(&self.inner.counters.deduplicated, 1);
                    debug!("Following in-flight load");
                    let _ = done.wait_for(|finished| *finished).await;

                    if self.should_abandon(&task) {
                        return Ok(());
                    }
                    if self.served_from_cache(&task).await {
                        return Ok(());
                    }
                    if self.should_abandon(&task) {
                        return Ok(());
                    }
                    debug!("Leader finished without caching, loading independently");
                }
            }
        }
    }

    async fn served_from_cache(&self, task: &SharedTask) -> bool {
        match task.try_load_from_cache().await {
            CacheResult::Found => {
                Counters::bump(&self.inner.counters.cache_hits, 1);
                debug!("Served from cache");
                true
            }
            CacheResult::ErrorOccurred => true,
            CacheResult::NotFound => false,
        }
    }

    fn should_abandon(&self, task: &SharedTask) -> bool {
        task.is_cancelled()
            || self.inner.signals.is_paused()
            || self.inner.signals.exit_tasks_early()
    }

    /// Cancel a task; no-op if it already finished or was cancelled
    ///
    /// Errors from the task's own cancellation are logged, never returned.
    pub fn cancel(&self, task: &SharedTask) {
        if task.is_cancelled() || task.is_completed() {
            return;
        }
        cancel_quietly(task);
        if self.remove_pending_task(task) {
            Counters::bump(&self.inner.counters.cancelled, 1);
        }
    }

    /// Drop a task from the queue without cancelling it
    pub fn remove_pending_task(&self, task: &SharedTask) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            let found = state
                .queue
                .iter()
                .find(|(pending, _)| same_task(&pending.task, task))
                .map(|(pending, _)| pending.clone());
            match found {
                Some(pending) => state.queue.remove(&pending).ok(),
                None => None,
            }
        };
        removed.is_some()
    }

    /// Pause or resume accepting work
    ///
    /// Pausing cancels every queued task; running tasks are left alone and
    /// nothing is replayed on resume.
    pub fn set_pause_work(&self, pause: bool) {
        self.inner.signals.set_paused(pause);
        if !pause {
            info!("Work scheduler resumed");
            return;
        }

        let drained = self.inner.state.lock().queue.drain();
        for pending in &drained {
            cancel_quietly(&pending.task);
        }
        Counters::bump(&self.inner.counters.cancelled, drained.len() as u64);
        info!(cancelled = drained.len(), "Work scheduler paused");
    }

    /// Ask tasks to stop early; also clears the pause flag
    pub fn set_exit_tasks_early(&self, exit: bool) {
        self.inner.signals.set_exit_early(exit);
        self.inner.signals.set_paused(false);
        info!(exit, "Exit-tasks-early changed");
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.inner.counters;
        SchedulerStats {
            pending: self.pending_count(),
            in_flight_keys: self.inner.in_flight.len(),
            running: self.inner.running.load(Ordering::Relaxed),
            max_parallel_tasks: self.max_parallel_tasks(),
            submitted: counters.submitted.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            deduplicated: counters.deduplicated.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            paused: self.is_paused(),
            exit_tasks_early: self.exit_tasks_early(),
        }
    }
}

fn cancel_quietly(task: &SharedTask) {
    if let Err(e) = task.cancel() {
        warn!(key = %task.key(), error = %e, "Task cancellation failed");
    }
}

impl Inner {
    fn register(&self, key: &str) -> Registration {
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(flight) => Registration::Follower(flight.get().done.clone()),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(false);
                slot.insert(Flight {
                    id,
                    done: rx.clone(),
                });
                Registration::Leader {
                    guard: CompletionGuard {
                        key: key.to_string(),
                        id,
                        tx,
                        in_flight: Arc::clone(&self.in_flight),
                    },
                    done: rx,
                }
            }
        }
    }

    /// Queue a leader and make sure a dispatch loop is running
    ///
    /// Returns false if the scheduler was paused in the meantime.
    fn enqueue(self: &Arc<Self>, task: SharedTask, guard: CompletionGuard) -> bool {
        let priority = task.priority();
        let pending = Pending {
            id: guard.id,
            task,
            _completion: Arc::new(guard),
        };

        let start_dispatch = {
            let mut state = self.state.lock();
            if self.signals.is_paused() {
                debug!("Paused while registering; dropping task");
                return false;
            }
            if let Err(e) = state.queue.enqueue(pending, priority) {
                warn!(error = %e, "Failed to queue task");
                return false;
            }
            !std::mem::replace(&mut state.dispatching, true)
        };

        if start_dispatch {
            tokio::spawn(Arc::clone(self).dispatch_loop());
        }
        true
    }

    async fn dispatch_loop(self: Arc<Self>) {
        debug!("Dispatch loop started");
        loop {
            let max = self.max_parallel.load(Ordering::Relaxed).max(1);
            let (batch, skipped) = {
                let mut state = self.state.lock();
                let mut batch = Vec::with_capacity(max);
                let mut skipped = Vec::new();
                while batch.len() < max {
                    let Some(next) = state.queue.try_dequeue() else {
                        break;
                    };
                    if next.task.is_cancelled() || next.task.is_completed() {
                        skipped.push(next);
                    } else {
                        batch.push(next);
                    }
                }
                if batch.is_empty() {
                    state.dispatching = false;
                }
                (batch, skipped)
            };

            if !skipped.is_empty() {
                // Completed tasks finished through another path; only cancellations count
                let cancelled = skipped
                    .iter()
                    .filter(|pending| pending.task.is_cancelled())
                    .count();
                debug!(
                    cancelled,
                    completed = skipped.len() - cancelled,
                    "Skipped queued tasks"
                );
                Counters::bump(&self.counters.cancelled, cancelled as u64);
            }
            drop(skipped);

            if batch.is_empty() {
                break;
            }

            let mut running = JoinSet::new();
            for pending in batch {
                running.spawn(Arc::clone(&self).run_pending(pending));
            }
            while let Some(joined) = running.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Load task panicked");
                    Counters::bump(&self.counters.failed, 1);
                }
            }
        }
        debug!("Dispatch loop idle");
    }

    async fn run_pending(self: Arc<Self>, pending: Pending) {
        let _slot = RunningSlot::enter(&self.running);
        match pending.task.run().await {
            Ok(()) => Counters::bump(&self.counters.completed, 1),
            Err(e) if e.is_cancellation() => {
                debug!(key = %pending.task.key(), "Task cancelled while running");
                Counters::bump(&self.counters.cancelled, 1);
            }
            Err(e) => {
                warn!(key = %pending.task.key(), error = %e, "Load task failed");
                Counters::bump(&self.counters.failed, 1);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[derive(Default)]
    struct Tally {
        cache: Mutex<HashSet<String>>,
        order: Mutex<Vec<String>>,
        runs: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    struct MockTask {
        key: String,
        priority: i32,
        delay: Duration,
        fail: bool,
        cancel_fails: bool,
        tally: Arc<Tally>,
        cancelled: AtomicBool,
        completed: AtomicBool,
        cancel_calls: AtomicUsize,
    }

    impl MockTask {
        fn new(key: &str, tally: &Arc<Tally>) -> Self {
            Self {
                key: key.to_string(),
                priority: 0,
                delay: Duration::from_millis(10),
                fail: false,
                cancel_fails: false,
                tally: Arc::clone(tally),
                cancelled: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                cancel_calls: AtomicUsize::new(0),
            }
        }

        fn with_priority(mut self, priority: i32) -> Self {
            self.priority = priority;
            self
        }

        fn delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn shared(self) -> Arc<MockTask> {
            Arc::new(self)
        }
    }

    #[async_trait]
    impl LoadTask for MockTask {
        fn key(&self) -> &str {
            &self.key
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }

        fn is_completed(&self) -> bool {
            self.completed.load(Ordering::SeqCst)
        }

        fn cancel(&self) -> Result<()> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            self.cancelled.store(true, Ordering::SeqCst);
            if self.cancel_fails {
                Err(Error::Internal("cancel hook failed".into()))
            } else {
                Ok(())
            }
        }

        async fn try_load_from_cache(&self) -> CacheResult {
            if self.tally.cache.lock().contains(&self.key) {
                self.completed.store(true, Ordering::SeqCst);
                CacheResult::Found
            } else {
                CacheResult::NotFound
            }
        }

        async fn run(&self) -> Result<()> {
            let tally = &self.tally;
            tally.runs.fetch_add(1, Ordering::SeqCst);
            tally.order.lock().push(self.key.clone());
            let now = tally.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            tally.max_concurrent.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            tally.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.completed.store(true, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Decode("corrupt image".into()));
            }
            tally.cache.lock().insert(self.key.clone());
            Ok(())
        }
    }

    fn scheduler(max_parallel: usize) -> WorkScheduler {
        WorkScheduler::new(&SchedulerConfig {
            max_parallel_tasks: Some(max_parallel),
        })
    }

    #[tokio::test]
    async fn test_invalid_key_fails_fast() {
        let scheduler = scheduler(2);
        let tally = Arc::new(Tally::default());

        let task: SharedTask = MockTask::new("   ", &tally).shared();
        assert_matches!(scheduler.load_image(Arc::clone(&task)), Err(Error::InvalidKey));
        assert_matches!(scheduler.load_image_async(task).await, Err(Error::InvalidKey));
        assert_eq!(tally.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_scheduling() {
        let scheduler = scheduler(2);
        let tally = Arc::new(Tally::default());
        tally.cache.lock().insert("a".into());

        scheduler
            .load_image_async(MockTask::new("a", &tally).shared())
            .await
            .unwrap();

        assert_eq!(tally.runs.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_cancelled_task_is_noop() {
        let scheduler = scheduler(2);
        let tally = Arc::new(Tally::default());
        let task = MockTask::new("a", &tally).shared();
        task.cancel().unwrap();

        scheduler.load_image_async(task).await.unwrap();
        assert_eq!(tally.runs.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.stats().submitted, 0);
    }

    #[tokio::test]
    async fn test_same_key_runs_once() {
        let scheduler = scheduler(4);
        let tally = Arc::new(Tally::default());
        let first = MockTask::new("a", &tally).shared();
        let second = MockTask::new("a", &tally).shared();

        let (r1, r2) = tokio::join!(
            scheduler.load_image_async(first.clone()),
            scheduler.load_image_async(second.clone()),
        );
        r1.unwrap();
        r2.unwrap();

        assert_eq!(tally.runs.load(Ordering::SeqCst), 1);
        assert!(second.is_completed());
        let stats = scheduler.stats();
        assert_eq!(stats.deduplicated, 1);
        assert_eq!(stats.in_flight_keys, 0);
    }

    #[tokio::test]
    async fn test_follower_loads_after_failed_leader() {
        let scheduler = scheduler(4);
        let tally = Arc::new(Tally::default());
        let leader = MockTask::new("a", &tally).failing().shared();
        let follower = MockTask::new("a", &tally).shared();

        let (r1, r2) = tokio::join!(
            scheduler.load_image_async(leader),
            scheduler.load_image_async(follower.clone()),
        );
        r1.unwrap();
        r2.unwrap();

        assert_eq!(tally.runs.load(Ordering::SeqCst), 2);
        assert_eq!(tally.max_concurrent.load(Ordering::SeqCst), 1);
        assert!(tally.cache.lock().contains("a"));
        assert_eq!(scheduler.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let scheduler = scheduler(2);
        let tally = Arc::new(Tally::default());

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let task = MockTask::new(&format!("k{}", i), &tally)
                    .delay(Duration::from_millis(30))
                    .shared();
                scheduler.load_image(task).unwrap()
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(tally.runs.load(Ordering::SeqCst), 6);
        assert!(tally.max_concurrent.load(Ordering::SeqCst) <= 2);
        assert_eq!(scheduler.stats().completed, 6);
    }

    #[tokio::test]
    async fn test_priority_order_with_fifo_ties() {
        let scheduler = scheduler(1);
        let tally = Arc::new(Tally::default());

        let inputs = [("low", -1), ("high1", 1), ("normal", 0), ("high2", 1)];
        let handles: Vec<_> = inputs
            .iter()
            .map(|(key, priority)| {
                let task = MockTask::new(key, &tally).with_priority(*priority).shared();
                scheduler.load_image(task).unwrap()
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(
            *tally.order.lock(),
            vec!["high1", "high2", "normal", "low"]
        );
    }

    #[tokio::test]
    async fn test_pause_cancels_pending_only() {
        let scheduler = scheduler(1);
        let tally = Arc::new(Tally::default());
        let running = MockTask::new("running", &tally)
            .delay(Duration::from_millis(60))
            .shared();
        let queued = MockTask::new("queued", &tally).shared();

        let h1 = scheduler.load_image(running.clone()).unwrap();
        let h2 = scheduler.load_image(queued.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        scheduler.set_pause_work(true);
        assert!(queued.is_cancelled());
        assert!(!running.is_cancelled());
        assert_eq!(scheduler.pending_count(), 0);

        h1.await.unwrap().unwrap();
        h2.await.unwrap().unwrap();
        assert_eq!(*tally.order.lock(), vec!["running"]);

        // Refused while paused
        scheduler
            .load_image_async(MockTask::new("later", &tally).shared())
            .await
            .unwrap();
        assert_eq!(tally.runs.load(Ordering::SeqCst), 1);

        scheduler.set_pause_work(false);
        scheduler
            .load_image_async(MockTask::new("later", &tally).shared())
            .await
            .unwrap();
        assert_eq!(tally.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_swallows_errors() {
        let scheduler = scheduler(1);
        let tally = Arc::new(Tally::default());
        let mut task = MockTask::new("a", &tally);
        task.cancel_fails = true;
        let task = task.shared();
        let shared: SharedTask = task.clone();

        scheduler.cancel(&shared);
        scheduler.cancel(&shared);
        assert_eq!(task.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_removes_pending_task() {
        let scheduler = scheduler(1);
        let tally = Arc::new(Tally::default());
        let blocker = MockTask::new("blocker", &tally)
            .delay(Duration::from_millis(50))
            .shared();
        let victim = MockTask::new("victim", &tally).shared();
        let victim_shared: SharedTask = victim.clone();

        let h1 = scheduler.load_image(blocker).unwrap();
        let h2 = scheduler.load_image(victim_shared.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.pending_count(), 1);

        scheduler.cancel(&victim_shared);
        assert_eq!(scheduler.pending_count(), 0);
        assert!(!scheduler.is_in_flight("victim"));

        h1.await.unwrap().unwrap();
        h2.await.unwrap().unwrap();
        assert_eq!(*tally.order.lock(), vec!["blocker"]);
    }

    #[tokio::test]
    async fn test_skipped_completed_task_is_not_counted_as_cancelled() {
        let scheduler = scheduler(1);
        let tally = Arc::new(Tally::default());
        let blocker = MockTask::new("blocker", &tally)
            .delay(Duration::from_millis(50))
            .shared();
        let finished = MockTask::new("finished", &tally).shared();
        let abandoned = MockTask::new("abandoned", &tally).shared();

        let h1 = scheduler.load_image(blocker).unwrap();
        let h2 = scheduler.load_image(finished.clone()).unwrap();
        let h3 = scheduler.load_image(abandoned.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.pending_count(), 2);

        // Both leave the queue state behind the scheduler's back
        finished.completed.store(true, Ordering::SeqCst);
        abandoned.cancel().unwrap();

        h1.await.unwrap().unwrap();
        h2.await.unwrap().unwrap();
        h3.await.unwrap().unwrap();

        assert_eq!(*tally.order.lock(), vec!["blocker"]);
        let stats = scheduler.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.cancelled, 1);
    }

    #[tokio::test]
    async fn test_remove_pending_task_without_cancel() {
        let scheduler = scheduler(1);
        let tally = Arc::new(Tally::default());
        let blocker = MockTask::new("blocker", &tally)
            .delay(Duration::from_millis(50))
            .shared();
        let other: SharedTask = MockTask::new("other", &tally).shared();

        let h1 = scheduler.load_image(blocker).unwrap();
        let h2 = scheduler.load_image(other.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(scheduler.remove_pending_task(&other));
        assert!(!scheduler.remove_pending_task(&other));
        assert!(!other.is_cancelled());

        h1.await.unwrap().unwrap();
        h2.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_exit_early_clears_pause() {
        let scheduler = scheduler(1);
        scheduler.set_pause_work(true);
        scheduler.set_exit_tasks_early(true);

        assert!(!scheduler.is_paused());
        assert!(scheduler.exit_tasks_early());
        assert!(scheduler.signals().exit_tasks_early());
    }

    #[tokio::test]
    async fn test_set_max_parallel_floor() {
        let scheduler = scheduler(3);
        scheduler.set_max_parallel_tasks(0);
        assert_eq!(scheduler.max_parallel_tasks(), 1);
    }
}
