//! Image Loading Pipeline
//!
//! Concrete [`LoadTask`](crate::scheduler::LoadTask) implementation plus the
//! pieces it pulls bytes and images from.
//!
//! # Pipeline
//!
//! ```text
//! ImageService::load(request)
//!   └─ ImageLoaderTask ──► WorkScheduler
//!        ├─ memory cache hit ─────────────► success(MemoryCache)
//!        ├─ disk cache hit ──► decode ────► success(DiskCache)
//!        └─ DataSource::fetch (retried) ──► decode ──► success(Internet | Disk | ...)
//!              └─ Internet bytes are queued for the disk cache
//! ```

mod decoder;
mod http;
mod service;
mod source;
mod task;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cache::DecodeConstraints;
use crate::error::Result;
use crate::scheduler::Priority;

pub use decoder::{Decoded, EncodedImage, ImageDecoder, PassthroughDecoder};
pub use http::{HttpConfig, HttpDownloader};
pub use service::{CacheScope, ImageService, LoadedImage, ServiceStats};
pub use source::{EmbeddedSource, FileSource};
pub use task::{Callbacks, ImageLoaderTask, LoaderContext, RetryPolicy, Sources, TaskOutcome};

// =============================================================================
// Loading Result
// =============================================================================

/// Where a delivered image came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingResult {
    MemoryCache,
    DiskCache,
    Disk,
    Internet,
    ApplicationBundle,
    CompiledResource,
}

impl LoadingResult {
    /// Whether the image was served by one of the caches
    pub fn is_cached(&self) -> bool {
        matches!(self, LoadingResult::MemoryCache | LoadingResult::DiskCache)
    }
}

impl fmt::Display for LoadingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadingResult::MemoryCache => "memory-cache",
            LoadingResult::DiskCache => "disk-cache",
            LoadingResult::Disk => "disk",
            LoadingResult::Internet => "internet",
            LoadingResult::ApplicationBundle => "application-bundle",
            LoadingResult::CompiledResource => "compiled-resource",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Data Sources
// =============================================================================

/// Produces the raw bytes of an image
#[async_trait]
pub trait DataSource: Send + Sync {
    /// What a successful fetch from this source reports
    fn loading_result(&self) -> LoadingResult;

    /// Fetch the bytes at `location`, stopping early when `token` fires
    async fn fetch(&self, location: &str, token: &CancellationToken) -> Result<Bytes>;
}

/// Where an image request points
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageSource {
    /// http(s) URL, disk-cached
    Url(String),
    /// Local file
    File(PathBuf),
    /// File relative to the application bundle root
    Bundle(String),
    /// Resource compiled into the binary
    Embedded(String),
}

impl ImageSource {
    /// Pick a source kind from a user-supplied string
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            ImageSource::Url(raw.to_string())
        } else if let Some(name) = raw.strip_prefix("bundle://") {
            ImageSource::Bundle(name.to_string())
        } else if let Some(name) = raw.strip_prefix("embedded://") {
            ImageSource::Embedded(name.to_string())
        } else {
            ImageSource::File(PathBuf::from(raw))
        }
    }

    /// Location string handed to the data source
    pub fn location(&self) -> String {
        match self {
            ImageSource::Url(url) => url.clone(),
            ImageSource::File(path) => path.display().to_string(),
            ImageSource::Bundle(name) | ImageSource::Embedded(name) => name.clone(),
        }
    }

    /// Default cache key
    pub fn cache_key(&self) -> String {
        match self {
            ImageSource::Url(url) => url.clone(),
            ImageSource::File(path) => path.display().to_string(),
            ImageSource::Bundle(name) => format!("bundle://{}", name),
            ImageSource::Embedded(name) => format!("embedded://{}", name),
        }
    }

    /// Only downloaded images go through the disk cache
    pub fn uses_disk_cache(&self) -> bool {
        matches!(self, ImageSource::Url(_))
    }
}

/// One image request
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub source: ImageSource,
    pub priority: Priority,
    /// Overrides the source-derived cache key
    pub custom_key: Option<String>,
    /// Target size; enables bitmap reuse from the memory cache
    pub constraints: Option<DecodeConstraints>,
    /// Disk cache TTL for downloaded bytes
    pub disk_ttl: Option<Duration>,
}

impl ImageRequest {
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            priority: Priority::Normal,
            custom_key: None,
            constraints: None,
            disk_ttl: None,
        }
    }

    /// Shorthand for [`ImageSource::parse`]
    pub fn from_source(raw: &str) -> Self {
        Self::new(ImageSource::parse(raw))
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.custom_key = Some(key.into());
        self
    }

    pub fn with_constraints(mut self, constraints: DecodeConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn with_disk_ttl(mut self, ttl: Duration) -> Self {
        self.disk_ttl = Some(ttl);
        self
    }

    /// Effective cache key
    pub fn key(&self) -> String {
        match &self.custom_key {
            Some(key) => key.clone(),
            None => self.source.cache_key(),
        }
    }
}
