//! Memory Cache Entry Types
//!
//! Decoded images are opaque [`ImageContainer`]s owned by platform code. The
//! cache wraps each one in an [`ImageEntry`] carrying three independent
//! reference counts; the container is disposed exactly once, when all three
//! counts drop to zero while the image is still valid.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use tracing::debug;

/// Capability set the cache needs from a platform image
pub trait ImageContainer: Send + Sync + 'static {
    /// Bytes charged against the cache budget
    fn size_in_bytes(&self) -> u64;

    /// Whether the underlying image can still be drawn
    fn is_valid(&self) -> bool;

    /// Release the native resources
    fn dispose(&self);

    /// Bytes of the backing allocation (may exceed `size_in_bytes`)
    fn allocation_bytes(&self) -> u64 {
        self.size_in_bytes()
    }

    /// Whether the backing allocation may be decoded into again
    fn is_mutable(&self) -> bool {
        false
    }
}

/// Requested decode dimensions, used to match reusable allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeConstraints {
    /// Target width in pixels
    pub width: u32,
    /// Target height in pixels
    pub height: u32,
    /// Bytes per pixel of the target format
    pub bytes_per_pixel: u32,
}

impl DecodeConstraints {
    /// Constraints for a 32-bit RGBA decode
    pub fn rgba(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel: 4,
        }
    }

    /// Bytes a decode with these constraints needs
    #[inline]
    pub fn footprint(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.bytes_per_pixel as u64
    }
}

/// Point-in-time copy of an entry's reference counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefCountSnapshot {
    pub cached: i32,
    pub displayed: i32,
    pub retained: i32,
}

/// Tri-state ownership counter
///
/// Releases never take a count below zero, so an unbalanced release cannot
/// swallow the next acquire.
#[derive(Debug, Default)]
pub struct RefCounts {
    cached: AtomicI32,
    displayed: AtomicI32,
    retained: AtomicI32,
}

impl RefCounts {
    /// Create zeroed counts
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply +1, or -1 clamped at zero, and return `(previous, current)`
    #[inline]
    fn adjust(counter: &AtomicI32, acquire: bool) -> (i32, i32) {
        if acquire {
            let previous = counter.fetch_add(1, Ordering::AcqRel);
            return (previous, previous + 1);
        }
        match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
            (count > 0).then(|| count - 1)
        }) {
            Ok(previous) => (previous, previous - 1),
            Err(current) => (current, current),
        }
    }

    /// Get current counts
    pub fn snapshot(&self) -> RefCountSnapshot {
        RefCountSnapshot {
            cached: self.cached.load(Ordering::Acquire),
            displayed: self.displayed.load(Ordering::Acquire),
            retained: self.retained.load(Ordering::Acquire),
        }
    }

    /// True when no owner holds the resource
    #[inline]
    pub fn should_free(&self) -> bool {
        let counts = self.snapshot();
        counts.cached <= 0 && counts.displayed <= 0 && counts.retained <= 0
    }
}

/// Effect of a display-count change on the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayTransition {
    /// Count went from not-displayed to displayed
    Shown,
    /// Count went from displayed to not-displayed
    Hidden,
    /// Still on the same side of zero
    Unchanged,
}

/// Cached image plus ownership bookkeeping
pub struct ImageEntry<C> {
    key: String,
    container: C,
    counts: RefCounts,
    valid: AtomicBool,
    freed: AtomicBool,
}

impl<C: ImageContainer> ImageEntry<C> {
    /// Wrap a container; all counts start at zero
    pub fn new(key: impl Into<String>, container: C) -> Self {
        Self {
            key: key.into(),
            container,
            counts: RefCounts::new(),
            valid: AtomicBool::new(true),
            freed: AtomicBool::new(false),
        }
    }

    /// Get the cache key
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the wrapped container
    #[inline]
    pub fn container(&self) -> &C {
        &self.container
    }

    /// Get the byte size charged to the cache
    #[inline]
    pub fn size_in_bytes(&self) -> u64 {
        self.container.size_in_bytes()
    }

    /// Whether the image is still usable and not yet freed
    pub fn has_valid_image(&self) -> bool {
        self.valid.load(Ordering::Acquire)
            && !self.freed.load(Ordering::Acquire)
            && self.container.is_valid()
    }

    /// Whether the container has been disposed by this entry
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// Get current reference counts
    pub fn counts(&self) -> RefCountSnapshot {
        self.counts.snapshot()
    }

    /// Check if a cache structure holds this entry
    pub fn is_cached(&self) -> bool {
        self.counts.cached.load(Ordering::Acquire) > 0
    }

    /// Check if the entry is on screen
    pub fn is_displayed(&self) -> bool {
        self.counts.displayed.load(Ordering::Acquire) > 0
    }

    /// Check if the entry is held out-of-band
    pub fn is_retained(&self) -> bool {
        self.counts.retained.load(Ordering::Acquire) > 0
    }

    /// Acquire or release the cache's hold
    pub fn set_cached(&self, cached: bool) {
        RefCounts::adjust(&self.counts.cached, cached);
        self.check_state();
    }

    /// Acquire or release a display hold
    pub fn set_displayed(&self, displayed: bool) -> DisplayTransition {
        let (previous, current) = RefCounts::adjust(&self.counts.displayed, displayed);
        let transition = if previous <= 0 && current > 0 {
            DisplayTransition::Shown
        } else if previous > 0 && current <= 0 {
            DisplayTransition::Hidden
        } else {
            DisplayTransition::Unchanged
        };
        self.check_state();
        transition
    }

    /// Acquire or release an explicit out-of-band hold
    pub fn set_retained(&self, retained: bool) {
        RefCounts::adjust(&self.counts.retained, retained);
        self.check_state();
    }

    /// Mark the image unusable without disposing it
    ///
    /// Used when platform code has already recycled the native image.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn check_state(&self) {
        if !self.counts.should_free() || !self.has_valid_image() {
            return;
        }
        if self
            .freed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(key = %self.key, bytes = self.size_in_bytes(), "Disposing image");
            self.container.dispose();
        }
    }
}

impl<C: ImageContainer> std::fmt::Debug for ImageEntry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageEntry")
            .field("key", &self.key)
            .field("size", &self.size_in_bytes())
            .field("counts", &self.counts())
            .field("freed", &self.is_freed())
            .finish()
    }
}

// =============================================================================
// Test Support
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Container that records how often it was disposed
    #[derive(Debug, Clone)]
    pub struct CountingImage {
        pub bytes: u64,
        pub mutable: bool,
        pub disposals: Arc<AtomicUsize>,
    }

    impl CountingImage {
        pub fn new(bytes: u64) -> Self {
            Self {
                bytes,
                mutable: false,
                disposals: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn mutable(bytes: u64) -> Self {
            Self {
                mutable: true,
                ..Self::new(bytes)
            }
        }

        pub fn disposals(&self) -> usize {
            self.disposals.load(Ordering::SeqCst)
        }
    }

    impl ImageContainer for CountingImage {
        fn size_in_bytes(&self) -> u64 {
            self.bytes
        }

        fn is_valid(&self) -> bool {
            self.disposals.load(Ordering::SeqCst) == 0
        }

        fn dispose(&self) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }

        fn is_mutable(&self) -> bool {
            self.mutable
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
