//! Byte-accounted LRU region
//!
//! Recency is tracked with a monotonically increasing tick per access; the
//! `BTreeMap` keyed by tick gives oldest-first iteration without a linked list.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::entry::{ImageContainer, ImageEntry};

struct Slot<C> {
    entry: Arc<ImageEntry<C>>,
    tick: u64,
    size: u64,
}

/// One recency-ordered region of the memory cache
pub(crate) struct LruRegion<C> {
    slots: HashMap<String, Slot<C>>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
    size_bytes: u64,
}

impl<C: ImageContainer> LruRegion<C> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            size_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Insert as most recent, returning any entry previously under `key`
    pub fn insert(&mut self, key: &str, entry: Arc<ImageEntry<C>>) -> Option<Arc<ImageEntry<C>>> {
        let previous = self.remove(key);
        let tick = self.tick();
        let size = entry.size_in_bytes();
        self.order.insert(tick, key.to_string());
        self.slots.insert(key.to_string(), Slot { entry, tick, size });
        self.size_bytes += size;
        previous
    }

    /// Look up and mark as most recent
    pub fn get(&mut self, key: &str) -> Option<Arc<ImageEntry<C>>> {
        let tick = self.tick();
        let slot = self.slots.get_mut(key)?;
        self.order.remove(&slot.tick);
        slot.tick = tick;
        self.order.insert(tick, key.to_string());
        Some(Arc::clone(&slot.entry))
    }

    /// Look up without touching recency
    pub fn peek(&self, key: &str) -> Option<&Arc<ImageEntry<C>>> {
        self.slots.get(key).map(|slot| &slot.entry)
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<ImageEntry<C>>> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.tick);
        self.size_bytes -= slot.size;
        Some(slot.entry)
    }

    /// Entries from least to most recently used
    pub fn oldest_first(&self) -> impl Iterator<Item = &Arc<ImageEntry<C>>> {
        self.order
            .values()
            .filter_map(move |key| self.slots.get(key).map(|slot| &slot.entry))
    }

    /// Pop least recently used entries until `target_bytes` is reached
    pub fn evict_to(&mut self, target_bytes: u64) -> Vec<Arc<ImageEntry<C>>> {
        let mut evicted = Vec::new();
        while self.size_bytes > target_bytes {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            if let Some(slot) = self.slots.remove(&key) {
                self.size_bytes -= slot.size;
                evicted.push(slot.entry);
            }
        }
        evicted
    }

    /// Remove everything, oldest first
    pub fn take_all(&mut self) -> Vec<Arc<ImageEntry<C>>> {
        let order = std::mem::take(&mut self.order);
        let mut slots = std::mem::take(&mut self.slots);
        self.size_bytes = 0;
        order
            .into_values()
            .filter_map(|key| slots.remove(&key).map(|slot| slot.entry))
            .collect()
    }
}
