//! imgload - Asynchronous image loading core
//!
//! Schedules image loads by priority with a bounded number running at once,
//! collapses concurrent requests for the same cache key, and keeps decoded
//! images in a byte-bounded memory cache backed by a persistent disk cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          ImageService                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐    │
//! │  │ WorkScheduler│───▶│ImageLoader   │───▶│ DataSource       │    │
//! │  │ (priority,   │    │Task          │    │ (http, file,     │    │
//! │  │  dedup)      │    │              │    │  bundle, embed)  │    │
//! │  └──────────────┘    └──────┬───────┘    └──────────────────┘    │
//! │                             │                                    │
//! │              ┌──────────────┴───────────────┐                    │
//! │              ▼                              ▼                    │
//! │     ┌──────────────────┐          ┌──────────────────┐           │
//! │     │ MemoryCache      │          │ DiskCache        │           │
//! │     │ (displayed LRU + │          │ (journaled or    │           │
//! │     │  reuse pool)     │          │  TTL-in-name)    │           │
//! │     └──────────────────┘          └──────────────────┘           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Memory and disk caches
//! - [`config`] - YAML configuration
//! - [`error`] - Error types
//! - [`loader`] - Loader task, data sources, decoders and the service
//! - [`metrics`] - Prometheus gauges
//! - [`queue`] - Priority queues
//! - [`scheduler`] - Work scheduler

pub mod cache;
pub mod config;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod queue;
pub mod scheduler;

// Re-export commonly used types
pub use cache::{DiskCache, DiskCacheConfig, ImageContainer, ImageEntry, MemoryCache};
pub use config::LoaderConfig;
pub use error::{Error, Result};
pub use loader::{ImageRequest, ImageService, ImageSource, LoadingResult};
pub use metrics::LoaderMetrics;
pub use queue::{PriorityQueue, SimplePriorityQueue};
pub use scheduler::{LoadTask, Priority, WorkScheduler};

/// Cache keys must contain something other than whitespace
pub(crate) fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(is_valid_key("http://example.com/a.png"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key(" \t\n"));
    }
}
