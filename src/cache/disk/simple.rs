//! Journal-less disk cache
//!
//! Each entry is a single file named `<sanitized-key>.<ttl-seconds>`; the
//! origin is the file's modification time. Cheap and crash-tolerant, but the
//! original key cannot be recovered from disk, so the index is keyed by the
//! sanitized name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::fs::File;
use tracing::{debug, info, instrument, warn};

use super::pending::PendingWrites;
use super::{
    recreate_dir, remove_file_quietly, sanitize_key, write_atomically, DiskCache,
    DiskCacheConfig, DiskCacheEntry, DiskCacheStats, DiskCounters,
};
use crate::error::Result;
use crate::is_valid_key;

/// Disk cache that encodes the TTL in each file name
#[derive(Clone)]
pub struct SimpleDiskCache {
    inner: Arc<Inner>,
}

struct Inner {
    base_path: PathBuf,
    default_ttl: Duration,
    /// Sanitized name -> entry
    entries: Mutex<HashMap<String, DiskCacheEntry>>,
    pending: PendingWrites,
    counters: DiskCounters,
}

/// Split `<name>.<ttl>` into its parts
fn parse_file_name(file_name: &str) -> Option<(&str, Duration)> {
    let (name, ttl) = file_name.rsplit_once('.')?;
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    let secs: u64 = ttl.parse().ok()?;
    Some((name, Duration::from_secs(secs)))
}

impl SimpleDiskCache {
    /// Open the cache at `config.path`, indexing existing files
    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub async fn open(config: &DiskCacheConfig) -> Result<Self> {
        let base_path = config.path.clone();
        tokio::fs::create_dir_all(&base_path).await?;

        let mut entries = HashMap::new();
        let mut dir = tokio::fs::read_dir(&base_path).await?;
        while let Some(item) = dir.next_entry().await? {
            let file_name = item.file_name().to_string_lossy().into_owned();
            let Some((name, ttl)) = parse_file_name(&file_name) else {
                if file_name.ends_with(".tmp") {
                    remove_file_quietly(&item.path()).await;
                }
                continue;
            };
            let origin = match item.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(e) => {
                    debug!(file = %file_name, error = %e, "Skipping unreadable cache file");
                    continue;
                }
            };
            entries.insert(
                name.to_string(),
                DiskCacheEntry {
                    key: name.to_string(),
                    file_name: file_name.clone(),
                    origin,
                    ttl,
                },
            );
        }

        info!(entries = entries.len(), "Opened simple disk cache");

        let cache = Self {
            inner: Arc::new(Inner {
                base_path,
                default_ttl: config.default_ttl(),
                entries: Mutex::new(entries),
                pending: PendingWrites::new(),
                counters: DiskCounters::default(),
            }),
        };

        let inner = Arc::clone(&cache.inner);
        let batch = config.sweep_batch_size;
        tokio::spawn(async move {
            let removed = inner.sweep_expired(batch).await;
            if removed > 0 {
                info!(removed, "Initial sweep removed expired entries");
            }
        });

        Ok(cache)
    }
}

impl Inner {
    fn live_entry(&self, name: &str) -> Option<DiskCacheEntry> {
        let entry = self.entries.lock().get(name).cloned()?;
        if entry.is_expired() {
            None
        } else {
            Some(entry)
        }
    }

    async fn write_entry(&self, name: &str, bytes: &[u8], ttl: Duration) -> Result<()> {
        let file_name = format!("{}.{}", name, ttl.as_secs());
        write_atomically(&self.base_path.join(&file_name), bytes).await?;

        let previous = self.entries.lock().insert(
            name.to_string(),
            DiskCacheEntry {
                key: name.to_string(),
                file_name: file_name.clone(),
                origin: Utc::now(),
                ttl,
            },
        );
        // A different TTL leaves the old file under another suffix
        if let Some(previous) = previous {
            if previous.file_name != file_name {
                remove_file_quietly(&self.base_path.join(previous.file_name)).await;
            }
        }
        Ok(())
    }

    async fn remove_entry(&self, name: &str) -> bool {
        let Some(entry) = self.entries.lock().remove(name) else {
            return false;
        };
        remove_file_quietly(&self.base_path.join(entry.file_name)).await;
        true
    }

    async fn sweep_expired(&self, batch: usize) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .entries
            .lock()
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .take(batch)
            .map(|entry| entry.key.clone())
            .collect();

        let mut removed = 0;
        for name in expired {
            if self.pending.contains(&name) {
                continue;
            }
            if self.remove_entry(&name).await {
                removed += 1;
            }
        }
        self.counters.record_expired(removed);
        removed
    }
}

#[async_trait]
impl DiskCache for SimpleDiskCache {
    fn add_to_saving_queue_if_not_exists(&self, key: &str, bytes: Bytes, ttl: Option<Duration>) {
        if !is_valid_key(key) {
            warn!("Ignoring disk cache write with empty key");
            return;
        }
        let name = sanitize_key(key);
        let Some(guard) = self.inner.pending.try_begin(&name) else {
            debug!(key = %key, "Disk cache write already pending");
            return;
        };

        let inner = Arc::clone(&self.inner);
        let ttl = ttl.unwrap_or(inner.default_ttl);
        tokio::spawn(async move {
            let _guard = guard;
            match inner.write_entry(&name, &bytes, ttl).await {
                Ok(()) => inner.counters.record_write(),
                Err(e) => {
                    inner.counters.record_write_failure();
                    warn!(file = %name, error = %e, "Failed to write disk cache entry");
                }
            }
        });
    }

    async fn try_get(&self, key: &str) -> Option<Bytes> {
        let name = sanitize_key(key);
        self.inner.pending.wait_for(&name).await;
        let entry = self.inner.live_entry(&name)?;
        match tokio::fs::read(self.inner.base_path.join(&entry.file_name)).await {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                debug!(key = %key, error = %e, "Disk cache read failed");
                None
            }
        }
    }

    async fn try_get_stream(&self, key: &str) -> Option<File> {
        let name = sanitize_key(key);
        self.inner.pending.wait_for(&name).await;
        let entry = self.inner.live_entry(&name)?;
        File::open(self.inner.base_path.join(&entry.file_name))
            .await
            .ok()
    }

    async fn exists(&self, key: &str) -> bool {
        let name = sanitize_key(key);
        self.inner.pending.wait_for(&name).await;
        match self.inner.live_entry(&name) {
            Some(entry) => tokio::fs::try_exists(self.inner.base_path.join(&entry.file_name))
                .await
                .unwrap_or(false),
            None => false,
        }
    }

    async fn entry(&self, key: &str) -> Option<DiskCacheEntry> {
        let name = sanitize_key(key);
        self.inner.pending.wait_for(&name).await;
        self.inner.entries.lock().get(&name).cloned()
    }

    async fn remove(&self, key: &str) {
        let name = sanitize_key(key);
        self.inner.pending.wait_for(&name).await;
        if self.inner.remove_entry(&name).await {
            self.inner.counters.record_removal();
        }
    }

    async fn clear(&self) {
        self.inner.pending.wait_all().await;
        self.inner.entries.lock().clear();
        match recreate_dir(&self.inner.base_path).await {
            Ok(()) => info!("Cleared disk cache"),
            Err(e) => warn!(error = %e, "Failed to clear disk cache"),
        }
    }

    async fn sweep_expired(&self, batch: usize) -> usize {
        self.inner.sweep_expired(batch).await
    }

    async fn wait_for_pending_writes(&self) {
        self.inner.pending.wait_all().await;
    }

    fn stats(&self) -> DiskCacheStats {
        let entries = self.inner.entries.lock().len();
        self.inner
            .counters
            .snapshot(entries, self.inner.pending.len())
    }

    fn base_path(&self) -> &Path {
        &self.inner.base_path
    }
}

// =============================================================================
// Tests
// =============================================================================
