//! In-memory image cache
//!
//! - [`ImageEntry`] - reference-counted wrapper around a platform image
//! - [`MemoryCache`] - displayed/reusable LRU regions with a reuse pool

mod cache;
mod entry;
mod lru;

pub use cache::{
    CacheEvent, MemoryCache, MemoryCacheConfig, MemoryCacheStats, DEFAULT_HIGH_WATERMARK,
    DEFAULT_LOW_WATERMARK,
};
pub use entry::{
    DecodeConstraints, DisplayTransition, ImageContainer, ImageEntry, RefCountSnapshot, RefCounts,
};

#[cfg(test)]
pub(crate) use entry::testing;
