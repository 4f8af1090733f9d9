//! Two-region memory cache
//!
//! ```text
//!   add() ──► [ reusable LRU ] ◄── demote (displayed 1→0)
//!                   │   ▲
//!     promote (0→1) │   │
//!                   ▼   │
//!             [ displayed LRU ]
//!
//!   reusable > high watermark ──► evict oldest until <= low watermark
//! ```
//!
//! Only the reusable region is evicted. Displayed entries stay resident until
//! the consumer reports that they left the screen.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::entry::{DecodeConstraints, DisplayTransition, ImageContainer, ImageEntry};
use super::lru::LruRegion;
use crate::error::{Error, Result};

/// Default high watermark (64 MiB)
pub const DEFAULT_HIGH_WATERMARK: u64 = 64 * 1024 * 1024;

/// Default low watermark (48 MiB)
pub const DEFAULT_LOW_WATERMARK: u64 = 48 * 1024 * 1024;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Memory cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Reusable-region size that triggers eviction
    pub high_watermark_bytes: u64,
    /// Size eviction stops at; also the reuse pool fill level
    pub low_watermark_bytes: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            high_watermark_bytes: DEFAULT_HIGH_WATERMARK,
            low_watermark_bytes: DEFAULT_LOW_WATERMARK,
        }
    }
}

impl MemoryCacheConfig {
    /// Config with a given budget; low watermark is 75% of it
    pub fn with_capacity(bytes: u64) -> Self {
        Self {
            high_watermark_bytes: bytes,
            low_watermark_bytes: bytes / 4 * 3,
        }
    }

    /// Validate watermark ordering
    pub fn validate(&self) -> Result<()> {
        if self.high_watermark_bytes == 0 {
            return Err(Error::Config(
                "memory high_watermark_bytes must be greater than 0".to_string(),
            ));
        }
        if self.low_watermark_bytes >= self.high_watermark_bytes {
            return Err(Error::Config(format!(
                "memory low_watermark_bytes ({}) must be below high_watermark_bytes ({})",
                self.low_watermark_bytes, self.high_watermark_bytes
            )));
        }
        Ok(())
    }
}

/// Notification emitted on cache membership changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Entry inserted into the reusable region
    Added { key: String, size: u64 },
    /// Entry left the cache (`evicted` is false for explicit removal)
    Removed { key: String, evicted: bool },
    /// Entry handed out for in-place decoding
    Reused { key: String },
    /// Entry moved to the displayed region
    Promoted { key: String },
    /// Entry moved back to the reusable region
    Demoted { key: String },
}

/// Memory cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryCacheStats {
    pub displayed_entries: usize,
    pub displayed_bytes: u64,
    pub reusable_entries: usize,
    pub reusable_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub reuses: u64,
    pub rejected: u64,
}

impl MemoryCacheStats {
    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Get total bytes across both regions
    pub fn total_bytes(&self) -> u64 {
        self.displayed_bytes + self.reusable_bytes
    }
}

struct Regions<C> {
    displayed: LruRegion<C>,
    reusable: LruRegion<C>,
    refill_needed: bool,
}

/// Entries the cache no longer holds, released after the lock is dropped
struct Released<C> {
    entries: Vec<(Arc<ImageEntry<C>>, bool)>,
}

impl<C: ImageContainer> Released<C> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn push(&mut self, entry: Arc<ImageEntry<C>>, evicted: bool) {
        self.entries.push((entry, evicted));
    }
}

/// Byte-bounded image cache with display tracking and a reuse pool
pub struct MemoryCache<C> {
    /// Both regions under one lock so moves between them are atomic
    regions: Mutex<Regions<C>>,
    /// Configuration
    config: MemoryCacheConfig,
    /// Membership notifications
    events: broadcast::Sender<CacheEvent>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    reuses: AtomicU64,
    rejected: AtomicU64,
}

impl<C: ImageContainer> Default for MemoryCache<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ImageContainer> MemoryCache<C> {
    /// Create a new memory cache with default configuration
    pub fn new() -> Self {
        Self::with_config(MemoryCacheConfig::default())
    }

    /// Create a new memory cache with custom configuration
    pub fn with_config(config: MemoryCacheConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            regions: Mutex::new(Regions {
                displayed: LruRegion::new(),
                reusable: LruRegion::new(),
                refill_needed: true,
            }),
            config,
            events,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &MemoryCacheConfig {
        &self.config
    }

    /// Subscribe to membership notifications
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Insert an entry, replacing any prior entry under the same key
    ///
    /// Returns false (and logs) when the entry has no usable image, is empty,
    /// or alone exceeds the high watermark.
    pub fn add(&self, key: &str, entry: Arc<ImageEntry<C>>) -> bool {
        if !entry.has_valid_image() {
            warn!(key = %key, "Rejecting invalid image for memory cache");
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let size = entry.size_in_bytes();
        if size == 0 {
            warn!(key = %key, "Rejecting zero-byte image for memory cache");
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if size > self.config.high_watermark_bytes {
            warn!(
                key = %key,
                size,
                high_watermark = self.config.high_watermark_bytes,
                "Rejecting image larger than the memory cache"
            );
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        // Take the cache's hold before any prior entry under this key (possibly
        // the same Arc) is released.
        entry.set_cached(true);

        let mut released = Released::new();
        {
            let mut regions = self.regions.lock();
            if let Some(prior) = regions.displayed.remove(key) {
                released.push(prior, true);
            }
            if let Some(prior) = regions.reusable.remove(key) {
                released.push(prior, true);
            }

            if entry.is_displayed() {
                regions.displayed.insert(key, Arc::clone(&entry));
            } else {
                regions.reusable.insert(key, Arc::clone(&entry));
                self.evict_locked(&mut regions, &mut released);
            }
        }

        debug!(key = %key, size, "Added image to memory cache");
        self.emit(CacheEvent::Added {
            key: key.to_string(),
            size,
        });
        self.release(released);
        true
    }

    /// Look up an entry, refreshing its recency
    pub fn get(&self, key: &str) -> Option<Arc<ImageEntry<C>>> {
        let mut released = Released::new();
        let found = {
            let mut regions = self.regions.lock();
            let found = regions
                .displayed
                .get(key)
                .or_else(|| regions.reusable.get(key));
            match found {
                Some(entry) if !entry.has_valid_image() => {
                    // Platform code recycled the image behind our back
                    regions.displayed.remove(key);
                    regions.reusable.remove(key);
                    released.push(entry, true);
                    None
                }
                other => other,
            }
        };
        self.release(released);

        match found {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Check membership without touching recency or counters
    pub fn contains(&self, key: &str) -> bool {
        let regions = self.regions.lock();
        regions.displayed.contains(key) || regions.reusable.contains(key)
    }

    /// Remove an entry from whichever region holds it
    pub fn remove(&self, key: &str) -> bool {
        let mut released = Released::new();
        {
            let mut regions = self.regions.lock();
            if let Some(entry) = regions.displayed.remove(key) {
                released.push(entry, false);
            }
            if let Some(entry) = regions.reusable.remove(key) {
                released.push(entry, false);
            }
        }
        let removed = !released.entries.is_empty();
        self.release(released);
        removed
    }

    /// Report a display-state change for a cached entry
    ///
    /// Returns false when the key is not cached.
    pub fn set_displayed(&self, key: &str, displayed: bool) -> bool {
        let mut released = Released::new();
        let mut event = None;
        {
            let mut regions = self.regions.lock();
            let entry = match regions
                .displayed
                .peek(key)
                .or_else(|| regions.reusable.peek(key))
            {
                Some(entry) => Arc::clone(entry),
                None => return false,
            };

            match entry.set_displayed(displayed) {
                DisplayTransition::Shown => {
                    if let Some(entry) = regions.reusable.remove(key) {
                        regions.displayed.insert(key, entry);
                        event = Some(CacheEvent::Promoted {
                            key: key.to_string(),
                        });
                    }
                }
                DisplayTransition::Hidden => {
                    if let Some(entry) = regions.displayed.remove(key) {
                        regions.reusable.insert(key, entry);
                        event = Some(CacheEvent::Demoted {
                            key: key.to_string(),
                        });
                        self.evict_locked(&mut regions, &mut released);
                    }
                }
                DisplayTransition::Unchanged => {}
            }
        }

        if let Some(event) = event {
            debug!(?event, "Display state changed");
            self.emit(event);
        }
        self.release(released);
        true
    }

    /// Hand out a reusable allocation for in-place decoding
    ///
    /// The returned entry is retained on behalf of the caller, who must call
    /// `set_retained(false)` when done. Returns `None` while the pool is
    /// refilling towards the low watermark.
    pub fn get_reusable_entry(&self, constraints: &DecodeConstraints) -> Option<Arc<ImageEntry<C>>> {
        let footprint = constraints.footprint();
        let entry = {
            let mut regions = self.regions.lock();
            if regions.refill_needed {
                if regions.reusable.size_bytes() < self.config.low_watermark_bytes {
                    return None;
                }
                regions.refill_needed = false;
            }

            let key = regions
                .reusable
                .oldest_first()
                .find(|entry| {
                    entry.has_valid_image()
                        && entry.container().is_mutable()
                        && !entry.is_retained()
                        && !entry.is_displayed()
                        && entry.container().allocation_bytes() >= footprint
                })
                .map(|entry| entry.key().to_string())?;

            let entry = regions.reusable.remove(&key)?;
            entry.set_retained(true);

            if regions.reusable.size_bytes() < self.config.low_watermark_bytes {
                regions.refill_needed = true;
            }
            entry
        };

        // Retained first, so dropping the cache's hold cannot dispose it
        entry.set_cached(false);
        self.reuses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %entry.key(), footprint, "Reusing cached allocation");
        self.emit(CacheEvent::Reused {
            key: entry.key().to_string(),
        });
        Some(entry)
    }

    /// Remove every entry from both regions
    pub fn clear(&self) {
        let mut released = Released::new();
        {
            let mut regions = self.regions.lock();
            for entry in regions.displayed.take_all() {
                released.push(entry, true);
            }
            for entry in regions.reusable.take_all() {
                released.push(entry, true);
            }
            regions.refill_needed = true;
        }
        debug!(entries = released.entries.len(), "Cleared memory cache");
        self.release(released);
    }

    /// Number of entries in both regions
    pub fn len(&self) -> usize {
        let regions = self.regions.lock();
        regions.displayed.len() + regions.reusable.len()
    }

    /// Check if the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get total bytes across both regions
    pub fn size_bytes(&self) -> u64 {
        let regions = self.regions.lock();
        regions.displayed.size_bytes() + regions.reusable.size_bytes()
    }

    /// Get cache statistics
    pub fn stats(&self) -> MemoryCacheStats {
        let regions = self.regions.lock();
        MemoryCacheStats {
            displayed_entries: regions.displayed.len(),
            displayed_bytes: regions.displayed.size_bytes(),
            reusable_entries: regions.reusable.len(),
            reusable_bytes: regions.reusable.size_bytes(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn evict_locked(&self, regions: &mut Regions<C>, released: &mut Released<C>) {
        if regions.reusable.size_bytes() <= self.config.high_watermark_bytes {
            return;
        }
        let evicted = regions.reusable.evict_to(self.config.low_watermark_bytes);
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        debug!(
            count = evicted.len(),
            remaining_bytes = regions.reusable.size_bytes(),
            "Evicted images from memory cache"
        );
        for entry in evicted {
            released.push(entry, true);
        }
    }

    /// Drop the cache's hold on entries that left the cache
    fn release(&self, released: Released<C>) {
        for (entry, evicted) in released.entries {
            self.emit(CacheEvent::Removed {
                key: entry.key().to_string(),
                evicted,
            });
            entry.set_cached(false);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::super::entry::testing::CountingImage;
    use super::*;

    fn entry(key: &str, image: &CountingImage) -> Arc<ImageEntry<CountingImage>> {
        Arc::new(ImageEntry::new(key, image.clone()))
    }

    fn small_cache() -> MemoryCache<CountingImage> {
        MemoryCache::with_config(MemoryCacheConfig {
            high_watermark_bytes: 300,
            low_watermark_bytes: 200,
        })
    }

    #[test]
    fn test_add_and_get() {
        let cache = small_cache();
        let image = CountingImage::new(100);
        assert!(cache.add("a", entry("a", &image)));

        let found = cache.get("a").unwrap();
        assert_eq!(found.key(), "a");
        assert!(found.is_cached());
        assert!(cache.get("missing").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.reusable_bytes, 100);
    }

    #[test]
    fn test_rejects_zero_byte_and_invalid() {
        let cache = small_cache();
        assert!(!cache.add("empty", entry("empty", &CountingImage::new(0))));

        let invalid = entry("bad", &CountingImage::new(10));
        invalid.invalidate();
        assert!(!cache.add("bad", invalid));

        assert!(cache.is_empty());
        assert_eq!(cache.stats().rejected, 2);
    }

    #[test]
    fn test_rejects_image_above_high_watermark() {
        let cache = small_cache();
        let image = CountingImage::new(301);
        let oversize = entry("big", &image);

        assert!(!cache.add("big", Arc::clone(&oversize)));
        assert!(!cache.contains("big"));
        assert_eq!(cache.stats().rejected, 1);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(image.disposals(), 0);
        assert!(oversize.has_valid_image());

        assert!(cache.add("fits", entry("fits", &CountingImage::new(300))));
    }

    #[test]
    fn test_replace_releases_prior_entry() {
        let cache = small_cache();
        let first = CountingImage::new(100);
        let second = CountingImage::new(50);

        cache.add("a", entry("a", &first));
        cache.add("a", entry("a", &second));

        assert_eq!(first.disposals(), 1);
        assert_eq!(second.disposals(), 0);
        assert_eq!(cache.size_bytes(), 50);
    }

    #[test]
    fn test_re_adding_same_entry_keeps_it_alive() {
        let cache = small_cache();
        let image = CountingImage::new(100);
        let shared = entry("a", &image);

        cache.add("a", Arc::clone(&shared));
        cache.add("a", Arc::clone(&shared));

        assert_eq!(image.disposals(), 0);
        assert_eq!(shared.counts().cached, 1);
    }

    #[test]
    fn test_eviction_to_low_watermark_in_lru_order() {
        let cache = small_cache();
        let images: Vec<_> = (0..4).map(|_| CountingImage::new(100)).collect();
        for (i, image) in images.iter().take(3).enumerate() {
            cache.add(&i.to_string(), entry(&i.to_string(), image));
        }
        // Touch "0" so "1" is the oldest
        cache.get("0");
        cache.add("3", entry("3", &images[3]));

        // 400 > 300 high, evict to <= 200 low: "1" then "2"
        assert!(!cache.contains("1"));
        assert!(!cache.contains("2"));
        assert!(cache.contains("0"));
        assert!(cache.contains("3"));
        assert_eq!(images[1].disposals(), 1);
        assert_eq!(cache.size_bytes(), 200);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_displayed_entries_are_not_evicted() {
        let cache = small_cache();
        let shown = CountingImage::new(100);
        cache.add("shown", entry("shown", &shown));
        assert!(cache.set_displayed("shown", true));

        for i in 0..5 {
            let key = format!("filler{}", i);
            cache.add(&key, entry(&key, &CountingImage::new(100)));
        }

        assert!(cache.contains("shown"));
        assert_eq!(shown.disposals(), 0);
        assert_eq!(cache.stats().displayed_entries, 1);
    }

    #[test]
    fn test_adding_displayed_entry_lands_in_displayed_region() {
        let cache = small_cache();
        let shown = entry("shown", &CountingImage::new(100));
        shown.set_displayed(true);

        assert!(cache.add("shown", Arc::clone(&shown)));
        let stats = cache.stats();
        assert_eq!(stats.displayed_entries, 1);
        assert_eq!(stats.reusable_entries, 0);

        assert!(cache.set_displayed("shown", false));
        assert_eq!(cache.stats().reusable_entries, 1);
    }

    #[test]
    fn test_demote_then_evict_frees_when_unreferenced() {
        let cache = small_cache();
        let image = CountingImage::new(100);
        cache.add("a", entry("a", &image));
        cache.set_displayed("a", true);
        cache.set_displayed("a", false);
        assert_eq!(cache.stats().reusable_entries, 1);

        cache.remove("a");
        assert_eq!(image.disposals(), 1);
    }

    #[test]
    fn test_remove_while_displayed_does_not_free() {
        let cache = small_cache();
        let image = CountingImage::new(100);
        let shared = entry("a", &image);
        cache.add("a", Arc::clone(&shared));
        cache.set_displayed("a", true);

        assert!(cache.remove("a"));
        assert_eq!(image.disposals(), 0);

        shared.set_displayed(false);
        assert_eq!(image.disposals(), 1);
        assert!(!cache.remove("a"));
    }

    #[test]
    fn test_reuse_waits_for_low_watermark() {
        let cache = small_cache();
        cache.add("a", entry("a", &CountingImage::mutable(100)));
        assert!(cache
            .get_reusable_entry(&DecodeConstraints::rgba(5, 5))
            .is_none());

        cache.add("b", entry("b", &CountingImage::mutable(100)));
        let reused = cache
            .get_reusable_entry(&DecodeConstraints::rgba(5, 5))
            .unwrap();
        assert_eq!(reused.key(), "a");
        assert!(reused.is_retained());
        assert!(!reused.is_cached());
        assert!(!cache.contains("a"));
        assert_eq!(cache.size_bytes(), 100);

        // Pool dropped below the low watermark again
        assert!(cache
            .get_reusable_entry(&DecodeConstraints::rgba(5, 5))
            .is_none());
    }

    #[test]
    fn test_reuse_requires_mutable_and_large_enough() {
        let cache = small_cache();
        cache.add("fixed", entry("fixed", &CountingImage::new(150)));
        cache.add("tiny", entry("tiny", &CountingImage::mutable(60)));

        assert!(cache
            .get_reusable_entry(&DecodeConstraints::rgba(5, 5))
            .is_none());

        let reused = cache
            .get_reusable_entry(&DecodeConstraints::rgba(3, 5))
            .unwrap();
        assert_eq!(reused.key(), "tiny");
    }

    #[test]
    fn test_reused_entry_freed_after_release() {
        let cache = small_cache();
        let image = CountingImage::mutable(250);
        cache.add("a", entry("a", &image));

        let reused = cache
            .get_reusable_entry(&DecodeConstraints::rgba(1, 1))
            .unwrap();
        assert_eq!(image.disposals(), 0);
        reused.set_retained(false);
        assert_eq!(image.disposals(), 1);
    }

    #[test]
    fn test_clear_releases_everything() {
        let cache = small_cache();
        let a = CountingImage::new(100);
        let b = CountingImage::new(100);
        cache.add("a", entry("a", &a));
        cache.add("b", entry("b", &b));
        cache.set_displayed("b", true);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(a.disposals(), 1);
        assert_eq!(b.disposals(), 0);
    }

    #[test]
    fn test_set_displayed_unknown_key() {
        let cache: MemoryCache<CountingImage> = small_cache();
        assert!(!cache.set_displayed("nope", true));
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let cache = small_cache();
        let mut events = cache.subscribe();

        cache.add("a", entry("a", &CountingImage::new(100)));
        cache.set_displayed("a", true);
        cache.set_displayed("a", false);
        cache.remove("a");

        assert_eq!(
            events.recv().await.unwrap(),
            CacheEvent::Added {
                key: "a".to_string(),
                size: 100
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            CacheEvent::Promoted {
                key: "a".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            CacheEvent::Demoted {
                key: "a".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            CacheEvent::Removed {
                key: "a".to_string(),
                evicted: false
            }
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(MemoryCacheConfig::default().validate().is_ok());
        assert!(MemoryCacheConfig::with_capacity(1000).validate().is_ok());
        let inverted = MemoryCacheConfig {
            high_watermark_bytes: 10,
            low_watermark_bytes: 20,
        };
        assert!(inverted.validate().is_err());
    }
}
