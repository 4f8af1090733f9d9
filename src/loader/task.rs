//! Image Loader Task
//!
//! The [`LoadTask`] the service hands to the scheduler. Each task delivers at
//! most one success or one error and always fires its finish callback exactly
//! once, on drop if nothing else got there first.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{DataSource, HttpConfig, ImageDecoder, ImageRequest, ImageSource, LoadingResult};
use crate::cache::{DiskCache, ImageEntry, MemoryCache};
use crate::error::{Error, Result};
use crate::scheduler::{CacheResult, LoadTask, SchedulerSignals};

// =============================================================================
// Shared Context
// =============================================================================

/// How transient fetch failures are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }
}

impl From<&HttpConfig> for RetryPolicy {
    fn from(config: &HttpConfig) -> Self {
        Self {
            retries: config.retry_count,
            delay: config.retry_delay(),
        }
    }
}

/// One data source per [`ImageSource`] kind
#[derive(Clone)]
pub struct Sources {
    pub http: Arc<dyn DataSource>,
    pub file: Arc<dyn DataSource>,
    pub bundle: Option<Arc<dyn DataSource>>,
    pub embedded: Option<Arc<dyn DataSource>>,
}

impl Sources {
    fn for_source(&self, source: &ImageSource) -> Result<&Arc<dyn DataSource>> {
        match source {
            ImageSource::Url(_) => Ok(&self.http),
            ImageSource::File(_) => Ok(&self.file),
            ImageSource::Bundle(_) => self
                .bundle
                .as_ref()
                .ok_or_else(|| Error::Config("no application bundle configured".to_string())),
            ImageSource::Embedded(_) => self
                .embedded
                .as_ref()
                .ok_or_else(|| Error::Config("no embedded resources configured".to_string())),
        }
    }
}

impl fmt::Debug for Sources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sources")
            .field("bundle", &self.bundle.is_some())
            .field("embedded", &self.embedded.is_some())
            .finish()
    }
}

/// Everything a task needs besides its request
pub struct LoaderContext<D: ImageDecoder> {
    pub memory: Arc<MemoryCache<D::Image>>,
    pub disk: Option<Arc<dyn DiskCache>>,
    pub sources: Sources,
    pub decoder: Arc<D>,
    pub signals: SchedulerSignals,
    pub retry: RetryPolicy,
}

// =============================================================================
// Callbacks
// =============================================================================

/// How a task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(LoadingResult),
    Failed,
    Cancelled,
}

type SuccessFn<C> = Box<dyn FnOnce(Arc<ImageEntry<C>>, LoadingResult) + Send>;
type ErrorFn = Box<dyn FnOnce(&Error) + Send>;
type FinishFn = Box<dyn FnOnce(TaskOutcome) + Send>;

/// Consumer hooks; each fires at most once
pub struct Callbacks<C> {
    on_success: Option<SuccessFn<C>>,
    on_error: Option<ErrorFn>,
    on_finish: Option<FinishFn>,
}

impl<C> Default for Callbacks<C> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
            on_finish: None,
        }
    }
}

impl<C> Callbacks<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(
        mut self,
        f: impl FnOnce(Arc<ImageEntry<C>>, LoadingResult) + Send + 'static,
    ) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_finish(mut self, f: impl FnOnce(TaskOutcome) + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }
}

// =============================================================================
// Task
// =============================================================================

/// Loads one [`ImageRequest`] through the caches and data sources
pub struct ImageLoaderTask<D: ImageDecoder> {
    key: String,
    request: ImageRequest,
    ctx: Arc<LoaderContext<D>>,
    token: CancellationToken,
    running: AtomicBool,
    completed: AtomicBool,
    callbacks: Mutex<Callbacks<D::Image>>,
}

impl<D: ImageDecoder> ImageLoaderTask<D> {
    pub fn new(
        request: ImageRequest,
        ctx: Arc<LoaderContext<D>>,
        callbacks: Callbacks<D::Image>,
    ) -> Self {
        Self {
            key: request.key(),
            request,
            ctx,
            token: CancellationToken::new(),
            running: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            callbacks: Mutex::new(callbacks),
        }
    }

    pub fn request(&self) -> &ImageRequest {
        &self.request
    }

    /// Token cancelled together with this task
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    fn checkpoint(&self) -> Result<()> {
        if self.token.is_cancelled() || self.ctx.signals.exit_tasks_early() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Hand a retained entry to `on_success`, then drop the task's hold
    ///
    /// The callback must retain the entry itself to keep it past the call.
    fn deliver(&self, entry: Arc<ImageEntry<D::Image>>, result: LoadingResult) {
        let on_success = self.callbacks.lock().on_success.take();
        if let Some(f) = on_success {
            f(Arc::clone(&entry), result);
        }
        entry.set_retained(false);
        self.finish(TaskOutcome::Success(result));
    }

    fn report(&self, err: &Error) {
        let on_error = self.callbacks.lock().on_error.take();
        if let Some(f) = on_error {
            f(err);
        }
        self.finish(TaskOutcome::Failed);
    }

    fn finish(&self, outcome: TaskOutcome) {
        self.completed.store(true, Ordering::SeqCst);
        let callbacks = {
            let mut callbacks = self.callbacks.lock();
            // Later success/error calls become no-ops
            callbacks.on_success = None;
            callbacks.on_error = None;
            callbacks.on_finish.take()
        };
        if let Some(f) = callbacks {
            f(outcome);
        }
    }

    async fn load(&self) -> Result<(Arc<ImageEntry<D::Image>>, LoadingResult)> {
        self.checkpoint()?;

        if let Some(data) = self.read_disk_cache().await {
            match self.decode(data).await {
                Ok(entry) => return self.store(entry, LoadingResult::DiskCache),
                Err(Error::Decode(reason)) => {
                    warn!(key = %self.key, "Dropping undecodable disk cache entry: {}", reason);
                    if let Some(disk) = &self.ctx.disk {
                        disk.remove(&self.key).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let (data, result) = self.fetch_with_retry().await?;
        self.checkpoint()?;

        if result == LoadingResult::Internet {
            if let Some(disk) = &self.ctx.disk {
                disk.add_to_saving_queue_if_not_exists(&self.key, data.clone(), self.request.disk_ttl);
            }
        }

        let entry = self.decode(data).await?;
        self.store(entry, result)
    }

    async fn read_disk_cache(&self) -> Option<Bytes> {
        if !self.request.source.uses_disk_cache() {
            return None;
        }
        let disk = self.ctx.disk.as_ref()?;
        disk.try_get(&self.key).await
    }

    async fn fetch_with_retry(&self) -> Result<(Bytes, LoadingResult)> {
        let source = self.ctx.sources.for_source(&self.request.source)?;
        let location = self.request.source.location();
        let retry = self.ctx.retry;

        let mut attempt = 0;
        loop {
            self.checkpoint()?;
            match source.fetch(&location, &self.token).await {
                Ok(data) => return Ok((data, source.loading_result())),
                Err(e) if e.is_transient() && attempt < retry.retries => {
                    attempt += 1;
                    debug!(key = %self.key, attempt, "Retrying after transient error: {}", e);
                    tokio::select! {
                        _ = self.token.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(retry.delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn decode(&self, data: Bytes) -> Result<Arc<ImageEntry<D::Image>>> {
        let constraints = self.request.constraints;
        let reuse = constraints
            .as_ref()
            .and_then(|c| self.ctx.memory.get_reusable_entry(c));

        let decoder = Arc::clone(&self.ctx.decoder);
        let candidate = reuse.clone();
        let decoded = tokio::task::spawn_blocking(move || {
            decoder.decode(
                data,
                constraints.as_ref(),
                candidate.as_ref().map(|entry| entry.container()),
            )
        })
        .await
        .map_err(|e| Error::Internal(format!("decoder task failed: {}", e)))
        .and_then(|decoded| decoded);

        if let Some(old) = reuse {
            if matches!(&decoded, Ok(d) if d.reused_allocation) {
                // The allocation now belongs to the new image
                old.invalidate();
            }
            old.set_retained(false);
        }

        let decoded = decoded?;
        Ok(Arc::new(ImageEntry::new(self.key.clone(), decoded.image)))
    }

    fn store(
        &self,
        entry: Arc<ImageEntry<D::Image>>,
        result: LoadingResult,
    ) -> Result<(Arc<ImageEntry<D::Image>>, LoadingResult)> {
        // Held until delivered; eviction inside `add` must not dispose it
        entry.set_retained(true);
        self.ctx.memory.add(&self.key, Arc::clone(&entry));
        if let Err(e) = self.checkpoint() {
            entry.set_retained(false);
            return Err(e);
        }
        Ok((entry, result))
    }
}

#[async_trait]
impl<D: ImageDecoder> LoadTask for ImageLoaderTask<D> {
    fn key(&self) -> &str {
        &self.key
    }

    fn priority(&self) -> i32 {
        self.request.priority.into()
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    fn cancel(&self) -> Result<()> {
        self.token.cancel();
        // A running task reports its own cancellation at the next checkpoint
        if !self.running.load(Ordering::SeqCst) {
            self.finish(TaskOutcome::Cancelled);
        }
        Ok(())
    }

    fn prepare(&self) {
        debug!(key = %self.key, source = ?self.request.source, "Preparing image load");
    }

    async fn try_load_from_cache(&self) -> CacheResult {
        let Some(entry) = self.ctx.memory.get(&self.key) else {
            return CacheResult::NotFound;
        };
        entry.set_retained(true);
        if !entry.has_valid_image() {
            // Evicted and disposed between lookup and hold
            entry.set_retained(false);
            return CacheResult::NotFound;
        }
        debug!(key = %self.key, "Memory cache hit");
        self.deliver(entry, LoadingResult::MemoryCache);
        CacheResult::Found
    }

    #[instrument(skip(self), fields(key = %self.key))]
    async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        match self.load().await {
            Ok((entry, result)) => {
                debug!(%result, bytes = entry.size_in_bytes(), "Image loaded");
                self.deliver(entry, result);
                Ok(())
            }
            Err(e) if e.is_cancellation() => {
                debug!("Image load cancelled");
                self.finish(TaskOutcome::Cancelled);
                Err(e)
            }
            Err(e) => {
                warn!("Image load failed: {}", e);
                self.report(&e);
                Err(e)
            }
        }
    }
}

impl<D: ImageDecoder> Drop for ImageLoaderTask<D> {
    fn drop(&mut self) {
        if let Some(f) = self.callbacks.get_mut().on_finish.take() {
            f(TaskOutcome::Cancelled);
        }
    }
}

impl<D: ImageDecoder> fmt::Debug for ImageLoaderTask<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageLoaderTask")
            .field("key", &self.key)
            .field("source", &self.request.source)
            .field("cancelled", &self.token.is_cancelled())
            .field("completed", &self.is_completed())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
