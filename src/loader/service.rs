//! Image Service
//!
//! Wires the scheduler, both caches and the data sources together and exposes
//! the operations an application calls.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use super::task::{Callbacks, ImageLoaderTask, LoaderContext, RetryPolicy, Sources, TaskOutcome};
use super::{DataSource, FileSource, HttpDownloader, ImageDecoder, ImageRequest, LoadingResult};
use crate::cache::{
    open_disk_cache, spawn_sweeper, DiskCache, DiskCacheStats, ImageContainer, ImageEntry,
    MemoryCache, MemoryCacheStats, SweeperGuard,
};
use crate::config::LoaderConfig;
use crate::error::{Error, Result};
use crate::scheduler::{SchedulerStats, SharedTask, WorkScheduler};

/// Which caches an invalidation touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    Memory,
    Disk,
    All,
}

/// A delivered image
///
/// Holds a retain on the entry so eviction cannot dispose it while the value
/// is alive; the hold is released on drop.
pub struct LoadedImage<C: ImageContainer> {
    pub entry: Arc<ImageEntry<C>>,
    pub result: LoadingResult,
}

impl<C: ImageContainer> LoadedImage<C> {
    fn retain(entry: Arc<ImageEntry<C>>, result: LoadingResult) -> Self {
        entry.set_retained(true);
        Self { entry, result }
    }
}

impl<C: ImageContainer> Drop for LoadedImage<C> {
    fn drop(&mut self) {
        self.entry.set_retained(false);
    }
}

impl<C: ImageContainer> std::fmt::Debug for LoadedImage<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedImage")
            .field("entry", &self.entry)
            .field("result", &self.result)
            .finish()
    }
}

/// Combined statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub scheduler: SchedulerStats,
    pub memory: MemoryCacheStats,
    pub disk: Option<DiskCacheStats>,
}

/// Front door of the loader
pub struct ImageService<D: ImageDecoder> {
    scheduler: WorkScheduler,
    ctx: Arc<LoaderContext<D>>,
    sweeper: Option<SweeperGuard>,
}

impl<D: ImageDecoder> ImageService<D> {
    /// Open the disk cache and build the default data sources
    #[instrument(skip_all, fields(disk = %config.disk.path.display()))]
    pub async fn open(config: &LoaderConfig, decoder: D) -> Result<Self> {
        config.validate()?;

        let disk = if config.disk_cache_enabled {
            Some(open_disk_cache(&config.disk).await?)
        } else {
            None
        };

        let sources = Sources {
            http: Arc::new(HttpDownloader::new(&config.http)?),
            file: Arc::new(FileSource::disk()),
            bundle: config
                .bundle_root
                .as_ref()
                .map(|root| Arc::new(FileSource::bundle(root)) as Arc<dyn DataSource>),
            embedded: None,
        };

        Ok(Self::from_parts(config, decoder, disk, sources))
    }

    /// Assemble a service from already-built parts
    ///
    /// Must be called inside a Tokio runtime when a sweep interval is set.
    pub fn from_parts(
        config: &LoaderConfig,
        decoder: D,
        disk: Option<Arc<dyn DiskCache>>,
        sources: Sources,
    ) -> Self {
        let scheduler = WorkScheduler::new(&config.scheduler);

        let sweeper = match (&disk, config.disk.sweep_interval_secs) {
            (Some(disk), Some(secs)) => Some(spawn_sweeper(
                disk,
                Duration::from_secs(secs),
                config.disk.sweep_batch_size,
            )),
            _ => None,
        };

        let ctx = Arc::new(LoaderContext {
            memory: Arc::new(MemoryCache::with_config(config.memory.clone())),
            disk,
            sources,
            decoder: Arc::new(decoder),
            signals: scheduler.signals(),
            retry: RetryPolicy::from(&config.http),
        });

        info!(
            max_parallel_tasks = scheduler.max_parallel_tasks(),
            disk_cache = ctx.disk.is_some(),
            "Image service ready"
        );

        Self {
            scheduler,
            ctx,
            sweeper,
        }
    }

    /// Build a task without submitting it
    pub fn task(
        &self,
        request: ImageRequest,
        callbacks: Callbacks<D::Image>,
    ) -> Arc<ImageLoaderTask<D>> {
        Arc::new(ImageLoaderTask::new(request, Arc::clone(&self.ctx), callbacks))
    }

    /// Submit a task and return immediately
    pub fn submit(&self, task: &Arc<ImageLoaderTask<D>>) -> Result<JoinHandle<Result<()>>> {
        let shared: SharedTask = task.clone();
        self.scheduler.load_image(shared)
    }

    /// Load an image and wait for the outcome
    pub async fn load(&self, request: ImageRequest) -> Result<LoadedImage<D::Image>> {
        let key = request.key();
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let (on_success, on_error, on_finish) = (Arc::clone(&slot), Arc::clone(&slot), slot);

        let callbacks = Callbacks::new()
            .on_success(move |entry, result| {
                resolve(&on_success, Ok(LoadedImage::retain(entry, result)));
            })
            .on_error(move |err| {
                resolve(
                    &on_error,
                    Err(Error::LoadFailed {
                        key,
                        reason: err.to_string(),
                        transient: err.is_transient(),
                    }),
                );
            })
            .on_finish(move |outcome| {
                if outcome == TaskOutcome::Cancelled {
                    resolve(&on_finish, Err(Error::Cancelled));
                }
            });

        let task: SharedTask = self.task(request, callbacks);
        self.scheduler.load_image_async(task).await?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Cancel a submitted task
    pub fn cancel(&self, task: &Arc<ImageLoaderTask<D>>) {
        let shared: SharedTask = task.clone();
        self.scheduler.cancel(&shared);
    }

    /// Report a display-state change for a cached image
    pub fn set_displayed(&self, key: &str, displayed: bool) -> bool {
        self.ctx.memory.set_displayed(key, displayed)
    }

    /// Drop one key from the chosen caches
    pub async fn invalidate(&self, key: &str, scope: CacheScope) {
        if matches!(scope, CacheScope::Memory | CacheScope::All) {
            self.ctx.memory.remove(key);
        }
        if matches!(scope, CacheScope::Disk | CacheScope::All) {
            if let Some(disk) = &self.ctx.disk {
                disk.remove(key).await;
            }
        }
    }

    pub fn clear_memory(&self) {
        self.ctx.memory.clear();
    }

    pub async fn clear_disk(&self) {
        if let Some(disk) = &self.ctx.disk {
            disk.clear().await;
        }
    }

    /// Refuse new work and cancel queued tasks (see [`WorkScheduler::set_pause_work`])
    pub fn set_pause_work(&self, pause: bool) {
        self.scheduler.set_pause_work(pause);
    }

    /// Ask running tasks to stop at their next checkpoint
    pub fn set_exit_tasks_early(&self, exit: bool) {
        self.scheduler.set_exit_tasks_early(exit);
    }

    pub fn scheduler(&self) -> &WorkScheduler {
        &self.scheduler
    }

    pub fn memory_cache(&self) -> &Arc<MemoryCache<D::Image>> {
        &self.ctx.memory
    }

    pub fn disk_cache(&self) -> Option<&Arc<dyn DiskCache>> {
        self.ctx.disk.as_ref()
    }

    /// Get a statistics snapshot
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            scheduler: self.scheduler.stats(),
            memory: self.ctx.memory.stats(),
            disk: self.ctx.disk.as_ref().map(|disk| disk.stats()),
        }
    }

    /// Stop background work and flush queued disk writes
    pub async fn shutdown(self) {
        self.scheduler.set_exit_tasks_early(true);
        if let Some(sweeper) = &self.sweeper {
            sweeper.stop();
        }
        if let Some(disk) = &self.ctx.disk {
            disk.wait_for_pending_writes().await;
        }
        info!("Image service stopped");
    }
}

fn resolve<T>(slot: &Mutex<Option<oneshot::Sender<T>>>, value: T) {
    if let Some(tx) = slot.lock().take() {
        let _ = tx.send(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{EmbeddedSource, PassthroughDecoder};
    use crate::scheduler::Priority;
    use assert_matches::assert_matches;

    fn service(dir: &std::path::Path) -> ImageService<PassthroughDecoder> {
        let mut config = LoaderConfig::default();
        config.disk.path = dir.to_path_buf();
        let embedded = EmbeddedSource::new()
            .with_resource("logo", &b"logo-bytes"[..])
            .with_resource("icon", &b"icon-bytes"[..]);
        let sources = Sources {
            http: Arc::new(FileSource::disk()),
            file: Arc::new(FileSource::disk()),
            bundle: Some(Arc::new(FileSource::bundle(dir))),
            embedded: Some(Arc::new(embedded)),
        };
        ImageService::from_parts(&config, PassthroughDecoder, None, sources)
    }

    #[tokio::test]
    async fn test_load_then_memory_hit() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let first = service
            .load(ImageRequest::from_source("embedded://logo"))
            .await
            .unwrap();
        assert_eq!(first.result, LoadingResult::CompiledResource);
        assert_eq!(&first.entry.container().data()[..], b"logo-bytes");

        let second = service
            .load(ImageRequest::from_source("embedded://logo").with_priority(Priority::High))
            .await
            .unwrap();
        assert_eq!(second.result, LoadingResult::MemoryCache);
        assert!(Arc::ptr_eq(&first.entry, &second.entry));
    }

    #[tokio::test]
    async fn test_load_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let result = service
            .load(ImageRequest::from_source("embedded://missing"))
            .await;
        assert_matches!(result, Err(Error::LoadFailed { transient: false, .. }));
        assert_eq!(service.stats().scheduler.failed, 1);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let request = ImageRequest::from_source("embedded://logo").with_key("  ");
        assert_matches!(service.load(request).await, Err(Error::InvalidKey));
    }

    #[tokio::test]
    async fn test_paused_service_cancels_loads() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        service.set_pause_work(true);

        assert_matches!(
            service.load(ImageRequest::from_source("embedded://logo")).await,
            Err(Error::Cancelled)
        );

        service.set_pause_work(false);
        assert!(service
            .load(ImageRequest::from_source("embedded://logo"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_invalidate_memory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), b"bundle-bytes").unwrap();
        let service = service(dir.path());

        let loaded = service
            .load(ImageRequest::from_source("bundle://a.png"))
            .await
            .unwrap();
        assert_eq!(loaded.result, LoadingResult::ApplicationBundle);
        assert!(service.memory_cache().contains("bundle://a.png"));

        service.invalidate("bundle://a.png", CacheScope::Memory).await;
        assert!(!service.memory_cache().contains("bundle://a.png"));

        let reloaded = service
            .load(ImageRequest::from_source("bundle://a.png"))
            .await
            .unwrap();
        assert_eq!(reloaded.result, LoadingResult::ApplicationBundle);
    }

    #[tokio::test]
    async fn test_submitted_task_fires_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let (tx, rx) = oneshot::channel();

        let task = service.task(
            ImageRequest::from_source("embedded://icon"),
            Callbacks::new().on_finish(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        service.submit(&task).unwrap().await.unwrap().unwrap();
        assert_eq!(
            rx.await.unwrap(),
            TaskOutcome::Success(LoadingResult::CompiledResource)
        );
    }

    #[tokio::test]
    async fn test_loaded_image_outlives_cache_removal() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let loaded = service
            .load(ImageRequest::from_source("embedded://logo"))
            .await
            .unwrap();
        assert!(format!("{:?}", loaded).contains("LoadedImage"));

        service.clear_memory();
        assert!(loaded.entry.has_valid_image());
        assert_eq!(&loaded.entry.container().data()[..], b"logo-bytes");

        let entry = Arc::clone(&loaded.entry);
        drop(loaded);
        assert!(entry.is_freed());
    }

    #[tokio::test]
    async fn test_display_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let loaded = service
            .load(ImageRequest::from_source("embedded://logo"))
            .await
            .unwrap();

        assert!(service.set_displayed("embedded://logo", true));
        assert!(loaded.entry.is_displayed());
        assert_eq!(service.stats().memory.displayed_entries, 1);

        assert!(service.set_displayed("embedded://logo", false));
        assert!(!service.set_displayed("embedded://other", true));
        service.clear_memory();
        assert!(service.memory_cache().is_empty());
    }
}
