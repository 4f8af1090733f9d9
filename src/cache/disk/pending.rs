//! In-flight write registry
//!
//! Each pending write owns a `watch` sender; readers clone the receiver and
//! wait for it to flip to `true`. The guard removes the key and signals on
//! drop, so a panicking writer still releases its waiters.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

#[derive(Debug, Default, Clone)]
pub(crate) struct PendingWrites {
    writes: Arc<DashMap<String, watch::Receiver<bool>>>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a write for `key`, or `None` if one is already pending
    pub fn try_begin(&self, key: &str) -> Option<PendingWriteGuard> {
        match self.writes.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(false);
                vacant.insert(rx);
                Some(PendingWriteGuard {
                    key: key.to_string(),
                    tx,
                    writes: Arc::clone(&self.writes),
                })
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.writes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Wait for the pending write of `key`, if any
    pub async fn wait_for(&self, key: &str) {
        let rx = self.writes.get(key).map(|rx| rx.value().clone());
        if let Some(mut rx) = rx {
            // Err means the writer is gone, which also means done
            let _ = rx.wait_for(|done| *done).await;
        }
    }

    /// Wait for every write pending at the time of the call
    pub async fn wait_all(&self) {
        let receivers: Vec<_> = self
            .writes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for mut rx in receivers {
            let _ = rx.wait_for(|done| *done).await;
        }
    }
}

/// Marks a write as in flight until dropped
#[derive(Debug)]
pub(crate) struct PendingWriteGuard {
    key: String,
    tx: watch::Sender<bool>,
    writes: Arc<DashMap<String, watch::Receiver<bool>>>,
}

impl Drop for PendingWriteGuard {
    fn drop(&mut self) {
        self.writes.remove(&self.key);
        self.tx.send_replace(true);
    }
}
