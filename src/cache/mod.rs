//! Two-tier image cache
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ memory: decoded images, byte-bounded LRU    │
//! │   displayed region  |  reusable region      │
//! └───────────────────────┬─────────────────────┘
//!                         │ miss
//! ┌───────────────────────▼─────────────────────┐
//! │ disk: encoded bytes, TTL expiry             │
//! │   journaled  |  simple (TTL in file name)   │
//! └─────────────────────────────────────────────┘
//! ```

pub mod disk;
pub mod memory;

pub use disk::{
    open_disk_cache, sanitize_key, spawn_sweeper, DiskCache, DiskCacheConfig, DiskCacheEntry,
    DiskCacheKind, DiskCacheStats, JournaledDiskCache, SimpleDiskCache, SweeperGuard,
};
pub use memory::{
    CacheEvent, DecodeConstraints, ImageContainer, ImageEntry, MemoryCache, MemoryCacheConfig,
    MemoryCacheStats,
};
