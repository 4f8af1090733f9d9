//! Journal-backed disk cache
//!
//! The in-memory index is rebuilt on open by replaying `.journal`. Every
//! successful file write appends `c`/`m`, every removal appends `d`, and all
//! appends are serialized through one async mutex around the journal handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::journal::{self, JournalOp, JOURNAL_FILE};
use super::pending::PendingWrites;
use super::{
    recreate_dir, remove_file_quietly, sanitize_key, write_atomically, DiskCache,
    DiskCacheConfig, DiskCacheEntry, DiskCacheStats, DiskCounters,
};
use crate::error::Result;
use crate::is_valid_key;

/// Durable disk cache with an append-only journal
#[derive(Clone)]
pub struct JournaledDiskCache {
    inner: Arc<Inner>,
}

struct Inner {
    base_path: PathBuf,
    journal_path: PathBuf,
    default_ttl: Duration,
    entries: Mutex<HashMap<String, DiskCacheEntry>>,
    journal: tokio::sync::Mutex<File>,
    pending: PendingWrites,
    counters: DiskCounters,
}

impl JournaledDiskCache {
    /// Open (or create) the cache at `config.path`
    ///
    /// An unreadable or incompatible journal wipes the directory and starts
    /// empty. An initial expiry sweep runs in the background.
    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub async fn open(config: &DiskCacheConfig) -> Result<Self> {
        let base_path = config.path.clone();
        let journal_path = base_path.join(JOURNAL_FILE);
        tokio::fs::create_dir_all(&base_path).await?;

        let entries = match load_journal(&base_path, &journal_path).await? {
            Some(entries) => entries,
            None => {
                recreate_dir(&base_path).await?;
                tokio::fs::write(&journal_path, journal::header()).await?;
                HashMap::new()
            }
        };

        let journal = OpenOptions::new()
            .append(true)
            .open(&journal_path)
            .await?;

        info!(entries = entries.len(), "Opened journaled disk cache");

        let cache = Self {
            inner: Arc::new(Inner {
                base_path,
                journal_path,
                default_ttl: config.default_ttl(),
                entries: Mutex::new(entries),
                journal: tokio::sync::Mutex::new(journal),
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

    /// Get the path of the journal file
    pub fn journal_path(&self) -> &Path {
        &self.inner.journal_path
    }
}

/// Replay an existing journal, compacting it if needed
///
/// Returns `None` when the directory has to be wiped.
async fn load_journal(
    base_path: &Path,
    journal_path: &Path,
) -> Result<Option<HashMap<String, DiskCacheEntry>>> {
    let text = match tokio::fs::read_to_string(journal_path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No journal found, starting fresh");
            return Ok(None);
        }
        Err(e) => {
            warn!(error = %e, "Journal unreadable, recreating cache directory");
            return Ok(None);
        }
    };

    let parsed = match journal::parse(&text) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Journal incompatible, recreating cache directory");
            return Ok(None);
        }
    };
    if parsed.skipped > 0 {
        warn!(skipped = parsed.skipped, "Skipped undecodable journal records");
    }

    let entries = journal::replay(&parsed.records);
    if journal::needs_compaction(parsed.records.len(), entries.len()) {
        let text = journal::compacted(entries.values());
        let tmp = base_path.join(format!("{}.tmp", JOURNAL_FILE));
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, journal_path).await?;
        info!(
            records = parsed.records.len(),
            live = entries.len(),
            "Compacted disk cache journal"
        );
    }
    Ok(Some(entries))
}

impl Inner {
    fn file_path(&self, entry: &DiskCacheEntry) -> PathBuf {
        self.base_path.join(&entry.file_name)
    }

    fn live_entry(&self, key: &str) -> Option<DiskCacheEntry> {
        let entry = self.entries.lock().get(key).cloned()?;
        if entry.is_expired() {
            None
        } else {
            Some(entry)
        }
    }

    async fn append(&self, record: &JournalOp) -> Result<()> {
        let mut line = record.to_line();
        line.push('\n');
        let mut journal = self.journal.lock().await;
        journal.write_all(line.as_bytes()).await?;
        journal.flush().await?;
        Ok(())
    }

    async fn write_entry(&self, key: &str, bytes: &[u8], ttl: Duration) -> Result<()> {
        let entry = DiskCacheEntry {
            key: key.to_string(),
            file_name: sanitize_key(key),
            origin: Utc::now(),
            ttl,
        };
        write_atomically(&self.file_path(&entry), bytes).await?;

        let existed = self.entries.lock().contains_key(key);
        self.append(&JournalOp::written(&entry, existed)).await?;
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove_entry(&self, key: &str) -> bool {
        let Some(entry) = self.entries.lock().remove(key) else {
            return false;
        };
        remove_file_quietly(&self.file_path(&entry)).await;
        if let Err(e) = self
            .append(&JournalOp::Deleted {
                key: key.to_string(),
            })
            .await
        {
            warn!(key = %key, error = %e, "Failed to journal removal");
        }
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
        for key in expired {
            if self.pending.contains(&key) {
                continue;
            }
            if self.remove_entry(&key).await {
                removed += 1;
            }
        }
        self.counters.record_expired(removed);
        removed
    }
}

#[async_trait]
impl DiskCache for JournaledDiskCache {
    fn add_to_saving_queue_if_not_exists(&self, key: &str, bytes: Bytes, ttl: Option<Duration>) {
        if !is_valid_key(key) {
            warn!("Ignoring disk cache write with empty key");
            return;
        }
        let Some(guard) = self.inner.pending.try_begin(key) else {
            debug!(key = %key, "Disk cache write already pending");
            return;
        };

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let ttl = ttl.unwrap_or(inner.default_ttl);
        tokio::spawn(async move {
            let _guard = guard;
            match inner.write_entry(&key, &bytes, ttl).await {
                Ok(()) => {
                    inner.counters.record_write();
                    debug!(key = %key, bytes = bytes.len(), "Wrote disk cache entry");
                }
                Err(e) => {
                    inner.counters.record_write_failure();
                    warn!(key = %key, error = %e, "Failed to write disk cache entry");
                }
            }
        });
    }

    async fn try_get(&self, key: &str) -> Option<Bytes> {
        self.inner.pending.wait_for(key).await;
        let entry = self.inner.live_entry(key)?;
        match tokio::fs::read(self.inner.file_path(&entry)).await {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                debug!(key = %key, error = %e, "Disk cache read failed");
                None
            }
        }
    }

    async fn try_get_stream(&self, key: &str) -> Option<File> {
        self.inner.pending.wait_for(key).await;
        let entry = self.inner.live_entry(key)?;
        File::open(self.inner.file_path(&entry)).await.ok()
    }

    async fn exists(&self, key: &str) -> bool {
        self.inner.pending.wait_for(key).await;
        match self.inner.live_entry(key) {
            Some(entry) => tokio::fs::try_exists(self.inner.file_path(&entry))
                .await
                .unwrap_or(false),
            None => false,
        }
    }

    async fn entry(&self, key: &str) -> Option<DiskCacheEntry> {
        self.inner.pending.wait_for(key).await;
        self.inner.entries.lock().get(key).cloned()
    }

    async fn remove(&self, key: &str) {
        self.inner.pending.wait_for(key).await;
        if self.inner.remove_entry(key).await {
            self.inner.counters.record_removal();
            debug!(key = %key, "Removed disk cache entry");
        }
    }

    #[instrument(skip(self), fields(path = %self.inner.base_path.display()))]
    async fn clear(&self) {
        self.inner.pending.wait_all().await;

        // Hold the journal lock so no append lands in the old file
        let mut journal = self.inner.journal.lock().await;
        self.inner.entries.lock().clear();

        let reset = async {
            recreate_dir(&self.inner.base_path).await?;
            tokio::fs::write(&self.inner.journal_path, journal::header()).await?;
            let file = OpenOptions::new()
                .append(true)
                .open(&self.inner.journal_path)
                .await?;
            Result::Ok(file)
        };
        match reset.await {
            Ok(file) => {
                *journal = file;
                info!("Cleared disk cache");
            }
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
