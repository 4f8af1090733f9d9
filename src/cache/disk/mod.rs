//! Disk cache for downloaded image bytes
//!
//! Two interchangeable implementations of [`DiskCache`]:
//!
//! - [`JournaledDiskCache`] - append-only journal, survives restarts exactly
//! - [`SimpleDiskCache`] - TTL encoded in the file name, no journal
//!
//! Writes are fire-and-forget: the caller queues bytes and returns, the file
//! is written on a background task, and readers of the same key wait for that
//! write instead of polling.

mod journal;
mod journaled;
mod pending;
mod simple;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub use journal::{JournalOp, JOURNAL_FILE};
pub use journaled::JournaledDiskCache;
pub use simple::SimpleDiskCache;

/// Default entry lifetime (30 days)
pub const DEFAULT_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Default number of entries removed per sweep pass
pub const DEFAULT_SWEEP_BATCH: usize = 100;

/// Maximum readable prefix kept from a key in its file name
const MAX_KEY_PREFIX: usize = 48;

// =============================================================================
// Configuration
// =============================================================================

/// Disk cache implementation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskCacheKind {
    /// Journal-backed cache
    #[default]
    Journaled,
    /// File-name TTL cache
    Simple,
}

impl std::str::FromStr for DiskCacheKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "journaled" => Ok(DiskCacheKind::Journaled),
            "simple" => Ok(DiskCacheKind::Simple),
            other => Err(Error::Config(format!("unknown disk cache kind: {}", other))),
        }
    }
}

/// Disk cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Cache directory
    pub path: PathBuf,
    /// Implementation to use
    pub kind: DiskCacheKind,
    /// Lifetime of entries written without an explicit TTL
    pub default_ttl_secs: u64,
    /// Interval of the background expiry sweep (`None` disables it)
    pub sweep_interval_secs: Option<u64>,
    /// Entries removed per sweep pass
    pub sweep_batch_size: usize,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("imgload-cache"),
            kind: DiskCacheKind::default(),
            default_ttl_secs: DEFAULT_TTL_SECS,
            sweep_interval_secs: None,
            sweep_batch_size: DEFAULT_SWEEP_BATCH,
        }
    }
}

impl DiskCacheConfig {
    /// Config rooted at `path` with default policy
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Get the default TTL
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::Config("disk cache path must not be empty".to_string()));
        }
        if self.default_ttl_secs == 0 {
            return Err(Error::Config(
                "disk cache default_ttl_secs must be greater than 0".to_string(),
            ));
        }
        if self.sweep_batch_size == 0 {
            return Err(Error::Config(
                "disk cache sweep_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.sweep_interval_secs == Some(0) {
            return Err(Error::Config(
                "disk cache sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Entries and Statistics
// =============================================================================

/// Metadata of one cached file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskCacheEntry {
    /// Cache key (the sanitized name for the simple variant)
    pub key: String,
    /// Name of the backing file inside the cache directory
    pub file_name: String,
    /// When the bytes were written
    pub origin: DateTime<Utc>,
    /// Lifetime from `origin`
    pub ttl: Duration,
}

impl DiskCacheEntry {
    /// Instant after which the entry is expired; `None` if it never expires
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).ok()?;
        self.origin
            .checked_add_signed(chrono::Duration::milliseconds(ttl_ms))
    }

    /// Check expiry against a given instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires) => expires < now,
            None => false,
        }
    }

    /// Check expiry against the current time
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Disk cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskCacheStats {
    pub entries: usize,
    pub pending_writes: usize,
    pub writes: u64,
    pub write_failures: u64,
    pub removals: u64,
    pub expired: u64,
}

/// Shared atomic counters behind [`DiskCacheStats`]
#[derive(Debug, Default)]
pub(crate) struct DiskCounters {
    writes: AtomicU64,
    write_failures: AtomicU64,
    removals: AtomicU64,
    expired: AtomicU64,
}

impl DiskCounters {
    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self, count: usize) {
        self.expired.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entries: usize, pending_writes: usize) -> DiskCacheStats {
        DiskCacheStats {
            entries,
            pending_writes,
            writes: self.writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// DiskCache Trait
// =============================================================================

/// Persistent byte cache keyed by image cache key
///
/// Absence is never an error: lookups return `None` for missing, expired or
/// unreadable entries.
#[async_trait]
pub trait DiskCache: Send + Sync {
    /// Queue bytes for writing unless a write for `key` is already pending
    ///
    /// Must be called from within a Tokio runtime. `ttl` falls back to the
    /// configured default.
    fn add_to_saving_queue_if_not_exists(&self, key: &str, bytes: Bytes, ttl: Option<Duration>);

    /// Read all bytes for a key
    async fn try_get(&self, key: &str) -> Option<Bytes>;

    /// Open the backing file for streaming reads
    async fn try_get_stream(&self, key: &str) -> Option<tokio::fs::File>;

    /// Check whether a live entry exists
    async fn exists(&self, key: &str) -> bool;

    /// Get entry metadata
    async fn entry(&self, key: &str) -> Option<DiskCacheEntry>;

    /// Remove an entry; no-op if absent
    async fn remove(&self, key: &str);

    /// Remove all entries and recreate the cache directory
    async fn clear(&self);

    /// Remove up to `batch` expired entries, returning how many were removed
    async fn sweep_expired(&self, batch: usize) -> usize;

    /// Wait until every queued write has finished
    async fn wait_for_pending_writes(&self);

    /// Get cache statistics
    fn stats(&self) -> DiskCacheStats;

    /// Get the cache directory
    fn base_path(&self) -> &Path;
}

/// Open the configured disk cache implementation
pub async fn open_disk_cache(config: &DiskCacheConfig) -> Result<Arc<dyn DiskCache>> {
    config.validate()?;
    let cache: Arc<dyn DiskCache> = match config.kind {
        DiskCacheKind::Journaled => Arc::new(JournaledDiskCache::open(config).await?),
        DiskCacheKind::Simple => Arc::new(SimpleDiskCache::open(config).await?),
    };
    Ok(cache)
}

// =============================================================================
// Background Sweeper
// =============================================================================

/// Handle to a periodic expiry sweep; stops the sweep when dropped
#[derive(Debug)]
pub struct SweeperGuard {
    token: CancellationToken,
}

impl SweeperGuard {
    /// Stop the sweep
    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for SweeperGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run `sweep_expired(batch)` every `interval` until the guard or cache is dropped
pub fn spawn_sweeper<D>(cache: &Arc<D>, interval: Duration, batch: usize) -> SweeperGuard
where
    D: DiskCache + ?Sized + 'static,
{
    let token = CancellationToken::new();
    let weak: Weak<D> = Arc::downgrade(cache);
    let child = token.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; the cache already swept on open
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = child.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(cache) = weak.upgrade() else { break };
                    let removed = cache.sweep_expired(batch).await;
                    if removed > 0 {
                        info!(removed, "Expiry sweep removed disk cache entries");
                    }
                }
            }
        }
        debug!("Disk cache sweeper stopped");
    });

    SweeperGuard { token }
}

// =============================================================================
// File Helpers
// =============================================================================

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Map a cache key onto a filesystem-safe file name
///
/// Keeps up to 48 ASCII alphanumerics for readability and appends a hash of
/// the full key so distinct keys never collide on the filtered prefix.
pub fn sanitize_key(key: &str) -> String {
    let prefix: String = key
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(MAX_KEY_PREFIX)
        .collect();
    format!("{}{:016x}", prefix, fx_hash(key.as_bytes()))
}

/// Write through a temporary file and rename into place
pub(crate) async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Delete a file, treating "already gone" as success
pub(crate) async fn remove_file_quietly(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to delete cache file");
            false
        }
    }
}

/// Delete and recreate a cache directory
pub(crate) async fn recreate_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    #[test]
    fn test_sanitize_key_is_filesystem_safe() {
        let name = sanitize_key("https://example.com/a b/../c?.png");
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(name.starts_with("httpsexamplecomabcpng"));
        assert_eq!(name.len(), "httpsexamplecomabcpng".len() + 16);
    }

    #[test]
    fn test_sanitize_key_distinguishes_filtered_collisions() {
        assert_ne!(sanitize_key("a/b"), sanitize_key("a.b"));
        assert_eq!(sanitize_key("same"), sanitize_key("same"));
    }

    #[test]
    fn test_sanitize_key_truncates_prefix() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_key(&long).len(), MAX_KEY_PREFIX + 16);
    }

    #[test]
    fn test_entry_expiry() {
        let origin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entry = DiskCacheEntry {
            key: "k".into(),
            file_name: sanitize_key("k"),
            origin,
            ttl: Duration::from_secs(60),
        };

        assert!(!entry.is_expired_at(origin + chrono::Duration::seconds(60)));
        assert!(entry.is_expired_at(origin + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let entry = DiskCacheEntry {
            key: "k".into(),
            file_name: sanitize_key("k"),
            origin: Utc::now(),
            ttl: Duration::MAX,
        };
        assert!(entry.expires_at().is_none());
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_config_validation() {
        assert!(DiskCacheConfig::default().validate().is_ok());
        let bad = DiskCacheConfig {
            sweep_batch_size: 0,
            ..DiskCacheConfig::default()
        };
        assert_matches!(bad.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("Simple".parse::<DiskCacheKind>().unwrap(), DiskCacheKind::Simple);
        assert!("fancy".parse::<DiskCacheKind>().is_err());
    }

    #[tokio::test]
    async fn test_write_atomically_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        write_atomically(&path, b"hello").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello");
        assert!(!dir.path().join("file.tmp").exists());
        assert!(remove_file_quietly(&path).await);
        assert!(remove_file_quietly(&path).await);
    }
}
