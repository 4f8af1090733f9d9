//! Prometheus metrics
//!
//! Gauges mirror the scheduler and cache statistics snapshots. The registry is
//! private to each [`LoaderMetrics`] so several services can coexist in one
//! process.

use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};
use crate::loader::ServiceStats;

const NAMESPACE: &str = "imgload";

/// Loader gauges backed by a private registry
#[derive(Clone)]
pub struct LoaderMetrics {
    registry: Registry,

    // Scheduler
    pending_tasks: IntGauge,
    running_tasks: IntGauge,
    in_flight_keys: IntGauge,
    submitted_total: IntGauge,
    deduplicated_total: IntGauge,
    completed_total: IntGauge,
    failed_total: IntGauge,
    cancelled_total: IntGauge,

    // Memory cache
    memory_entries: IntGauge,
    memory_bytes: IntGauge,
    memory_hits_total: IntGauge,
    memory_misses_total: IntGauge,
    memory_evictions_total: IntGauge,
    memory_reuses_total: IntGauge,

    // Disk cache
    disk_entries: IntGauge,
    disk_pending_writes: IntGauge,
    disk_write_failures_total: IntGauge,
    disk_expired_total: IntGauge,
}

impl LoaderMetrics {
    /// Create and register all gauges
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
                .map_err(metrics_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metrics_error)?;
            Ok(gauge)
        };

        Ok(Self {
            pending_tasks: gauge("scheduler_pending_tasks", "Tasks waiting in the queue")?,
            running_tasks: gauge("scheduler_running_tasks", "Tasks currently running")?,
            in_flight_keys: gauge("scheduler_in_flight_keys", "Keys with a load in flight")?,
            submitted_total: gauge("scheduler_submitted_total", "Requests submitted")?,
            deduplicated_total: gauge(
                "scheduler_deduplicated_total",
                "Requests attached to an in-flight load",
            )?,
            completed_total: gauge("scheduler_completed_total", "Tasks completed")?,
            failed_total: gauge("scheduler_failed_total", "Tasks failed")?,
            cancelled_total: gauge("scheduler_cancelled_total", "Tasks cancelled")?,
            memory_entries: gauge("memory_cache_entries", "Entries in the memory cache")?,
            memory_bytes: gauge("memory_cache_bytes", "Bytes held by the memory cache")?,
            memory_hits_total: gauge("memory_cache_hits_total", "Memory cache hits")?,
            memory_misses_total: gauge("memory_cache_misses_total", "Memory cache misses")?,
            memory_evictions_total: gauge(
                "memory_cache_evictions_total",
                "Entries evicted from the memory cache",
            )?,
            memory_reuses_total: gauge(
                "memory_cache_reuses_total",
                "Allocations handed out for reuse",
            )?,
            disk_entries: gauge("disk_cache_entries", "Entries in the disk cache")?,
            disk_pending_writes: gauge("disk_cache_pending_writes", "Queued disk writes")?,
            disk_write_failures_total: gauge(
                "disk_cache_write_failures_total",
                "Failed disk cache writes",
            )?,
            disk_expired_total: gauge("disk_cache_expired_total", "Entries removed by expiry")?,
            registry,
        })
    }

    /// Refresh every gauge from a stats snapshot
    pub fn update(&self, stats: &ServiceStats) {
        let s = &stats.scheduler;
        self.pending_tasks.set(s.pending as i64);
        self.running_tasks.set(s.running as i64);
        self.in_flight_keys.set(s.in_flight_keys as i64);
        self.submitted_total.set(s.submitted as i64);
        self.deduplicated_total.set(s.deduplicated as i64);
        self.completed_total.set(s.completed as i64);
        self.failed_total.set(s.failed as i64);
        self.cancelled_total.set(s.cancelled as i64);

        let m = &stats.memory;
        self.memory_entries
            .set((m.displayed_entries + m.reusable_entries) as i64);
        self.memory_bytes.set(m.total_bytes() as i64);
        self.memory_hits_total.set(m.hits as i64);
        self.memory_misses_total.set(m.misses as i64);
        self.memory_evictions_total.set(m.evictions as i64);
        self.memory_reuses_total.set(m.reuses as i64);

        if let Some(d) = &stats.disk {
            self.disk_entries.set(d.entries as i64);
            self.disk_pending_writes.set(d.pending_writes as i64);
            self.disk_write_failures_total.set(d.write_failures as i64);
            self.disk_expired_total.set(d.expired as i64);
        }
    }

    /// Get the underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the text exposition format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_error(err: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DiskCacheStats, MemoryCacheStats};
    use crate::scheduler::SchedulerStats;

    #[test]
    fn test_encode_reflects_snapshot() {
        let metrics = LoaderMetrics::new().unwrap();
        let stats = ServiceStats {
            scheduler: SchedulerStats {
                pending: 3,
                completed: 7,
                ..Default::default()
            },
            memory: MemoryCacheStats {
                reusable_entries: 2,
                reusable_bytes: 2048,
                ..Default::default()
            },
            disk: Some(DiskCacheStats {
                entries: 5,
                ..Default::default()
            }),
        };
        metrics.update(&stats);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("imgload_scheduler_pending_tasks 3"));
        assert!(text.contains("imgload_scheduler_completed_total 7"));
        assert!(text.contains("imgload_memory_cache_bytes 2048"));
        assert!(text.contains("imgload_disk_cache_entries 5"));
    }

    #[test]
    fn test_independent_registries() {
        let a = LoaderMetrics::new().unwrap();
        let b = LoaderMetrics::new().unwrap();
        a.pending_tasks.set(1);
        assert_eq!(b.pending_tasks.get(), 0);
        assert_eq!(a.registry().gather().len(), b.registry().gather().len());
    }
}
