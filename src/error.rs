//! Error types for the image loader

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while scheduling, caching or loading images
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Scheduler Errors
    // =========================================================================
    /// Cache key was empty or whitespace
    #[error("Invalid cache key: key must not be empty or whitespace")]
    InvalidKey,

    /// Task was cancelled before it could finish
    #[error("Task was cancelled")]
    Cancelled,

    // =========================================================================
    // Priority Queue Errors
    // =========================================================================
    /// Queue is at its fixed capacity
    #[error("Priority queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Queue has no items
    #[error("Priority queue is empty")]
    QueueEmpty,

    /// Item is not in the queue
    #[error("Item is not in the priority queue")]
    ItemNotFound,

    /// Item is already in the queue
    #[error("Item is already in the priority queue")]
    DuplicateItem,

    /// Requested capacity cannot hold the queue
    #[error("Invalid queue capacity {requested} (queue holds {count} items)")]
    InvalidCapacity { requested: usize, count: usize },

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Disk cache journal is unreadable or incompatible
    #[error("Disk cache journal error: {0}")]
    Journal(String),

    // =========================================================================
    // Download Errors
    // =========================================================================
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[source] reqwest::Error),

    /// Server answered with a non-success status
    #[error("HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    /// No response headers before the header timeout fired
    #[error("Timed out after {timeout:?} waiting for response headers from {url}")]
    HeaderTimeout { url: String, timeout: Duration },

    /// Body was not fully read before the read timeout fired
    #[error("Timed out after {timeout:?} reading response body from {url}")]
    ReadTimeout { url: String, timeout: Duration },

    /// Download failed for another reason
    #[error("Download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    /// Image request failed (reported through the loader's error callback)
    #[error("Loading {key} failed: {reason}")]
    LoadFailed {
        key: String,
        reason: String,
        transient: bool,
    },

    // =========================================================================
    // Decoding / Configuration Errors
    // =========================================================================
    /// Decoder rejected the data
    #[error("Decoding failed: {0}")]
    Decode(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the operation that produced this error may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_)
            | Error::HeaderTimeout { .. }
            | Error::ReadTimeout { .. }
            | Error::Download { .. } => true,
            Error::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Error::LoadFailed { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Whether this error represents cancellation rather than failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err)
    }
}

// =============================================================================
// Tests
// =============================================================================
