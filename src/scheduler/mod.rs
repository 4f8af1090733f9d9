//! Work Scheduler
//!
//! Orders image loads by priority, runs a bounded number at a time, and
//! collapses concurrent requests for the same cache key onto one leader.
//!
//! # Request Flow
//!
//! ```text
//! load_image(task)
//!   ├─ invalid key ─────────────► Err(InvalidKey)
//!   ├─ cancelled ───────────────► done
//!   ├─ cache Found/Error ───────► done
//!   ├─ paused / exiting ────────► done
//!   └─ prepare()
//!        ├─ key in flight ──► follow: wait, re-check cache, else retry as leader
//!        └─ key idle ───────► enqueue by priority ──► dispatch loop (N at a time)
//! ```

mod work;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};

pub use work::{SchedulerStats, SharedTask, WorkScheduler};

/// Fallback CPU count when detection fails
pub const FALLBACK_CPU_COUNT: usize = 2;

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum concurrently running tasks (`None` = half the CPUs, at least 1)
    pub max_parallel_tasks: Option<usize>,
}

impl SchedulerConfig {
    /// Resolve the effective parallelism
    pub fn resolved_max_parallel_tasks(&self) -> usize {
        self.max_parallel_tasks
            .unwrap_or_else(default_max_parallel_tasks)
            .max(1)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_tasks == Some(0) {
            return Err(Error::Config(
                "max_parallel_tasks must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Half the available processors, minimum 1
pub fn default_max_parallel_tasks() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(FALLBACK_CPU_COUNT);
    (cpus / 2).max(1)
}

// =============================================================================
// Task Contract
// =============================================================================

/// Outcome of a task's own cache lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheResult {
    /// Served from cache; the task already delivered the image
    Found,
    /// Not cached; the task must run
    NotFound,
    /// Lookup failed and the task already reported the error
    ErrorOccurred,
}

/// Scheduling priority; larger values run first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = -1,
    #[default]
    Normal = 0,
    High = 1,
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority as i32
    }
}

/// One image load the scheduler can run
#[async_trait]
pub trait LoadTask: Send + Sync {
    /// Cache key used for deduplication
    fn key(&self) -> &str;

    /// Queue priority
    fn priority(&self) -> i32 {
        Priority::Normal.into()
    }

    fn is_cancelled(&self) -> bool;

    fn is_completed(&self) -> bool;

    /// Request cancellation
    fn cancel(&self) -> Result<()>;

    /// Called once before the task is queued or attached to a leader
    fn prepare(&self) {}

    /// Try to satisfy the request from cache
    async fn try_load_from_cache(&self) -> CacheResult;

    /// Do the actual load
    async fn run(&self) -> Result<()>;
}

// =============================================================================
// Shared Signals
// =============================================================================

/// Global flags shared between the scheduler and its tasks
#[derive(Debug, Clone, Default)]
pub struct SchedulerSignals {
    paused: Arc<AtomicBool>,
    exit_early: Arc<AtomicBool>,
}

impl SchedulerSignals {
    /// Check if new work is being refused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Check if tasks should stop at their next checkpoint
    pub fn exit_tasks_early(&self) -> bool {
        self.exit_early.load(Ordering::Acquire)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub(crate) fn set_exit_early(&self, exit: bool) {
        self.exit_early.store(exit, Ordering::Release);
    }
}
