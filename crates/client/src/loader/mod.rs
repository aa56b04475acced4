//! The image loader: memory cache, disk cache and network behind one call.
//!
//! Every load walks the same path:
//!
//! ```text
//! memory ──hit──► HasCache(Memory) ─┐
//!    │                              │
//!  miss                             ▼
//!    ▼                     disk metadata + policy ──fresh──► done
//! disk ───hit──► HasCache(Disk) ────┘        │
//!    │                                     stale / miss
//!  miss ──────────────────────────────────►  ▼
//!                               SendingRequest ─► in-flight registry
//!                                                   │
//!                                  initiator: conditional or full request
//!                                  joiners:   wait for the same outcome
//! ```
//!
//! Two entry points share that path. [`ImageLoader::load`] reports each
//! phase as a [`LoadEvent`]; [`ImageLoader::cache_image`] resolves once
//! with a [`CachedImage`] that also names the payload file on disk.

mod error;
mod events;
mod pipeline;
mod request;


use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::HeaderValue;
use parking_lot::RwLock;
use pixcache_core::{AppConfig, CachePolicy, DiskStore, MemoryCache};
use tokio::sync::{Mutex, mpsc};

pub use error::{LoadError, SetupError};
pub use events::{CacheTask, CachedImage, LoadEvent, LoadHandle, LoadSource, LoadedImage};
pub use request::ImageRequest;

use self::events::NetworkControl;
use self::pipeline::{NetworkOutcome, Variant};
use crate::fetch::{HttpTransport, ReqwestTransport, TransportConfig, basic_authorization};
use crate::inflight::{InFlightRegistry, RegistryStats};

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);
const ONE_WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

static SHARED: Mutex<Option<ImageLoader>> = Mutex::const_new(None);

/// Source of "now" for freshness decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub(crate) struct LoaderInner {
    pub(crate) config: AppConfig,
    pub(crate) policy: CachePolicy,
    pub(crate) memory: MemoryCache,
    pub(crate) disk: DiskStore,
    pub(crate) transport: Arc<dyn HttpTransport>,
    pub(crate) registry: InFlightRegistry<NetworkOutcome>,
    pub(crate) authorization: RwLock<Option<HeaderValue>>,
    pub(crate) clock: Arc<dyn Clock>,
}

/// Loads images through the memory and disk caches, fetching from the
/// network only when the cache policy requires it.
///
/// Cloning is cheap; clones share caches and in-flight requests.
#[derive(Clone)]
pub struct ImageLoader {
    inner: Arc<LoaderInner>,
}

/// Builder for [`ImageLoader`].
pub struct ImageLoaderBuilder {
    config: AppConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    clock: Arc<dyn Clock>,
}

impl ImageLoaderBuilder {
    /// Use `transport` instead of a reqwest client built from the config.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and open the cache directory.
    ///
    /// # Errors
    ///
    /// Returns `SetupError` if the configuration is invalid, the cache
    /// directory cannot be created, or the HTTP client cannot be built.
    pub async fn build(self) -> Result<ImageLoader, SetupError> {
        let config = self.config;
        config.validate()?;

        let disk = DiskStore::open(&config.cache_dir).await?;
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(TransportConfig::from(&config))?),
        };
        let authorization = config.credentials().and_then(|(user, pass)| basic_authorization(Some(user), Some(pass)));

        tracing::debug!(
            cache_dir = %config.cache_dir.display(),
            memory_max_bytes = config.memory_max_bytes,
            use_server_cache_policy = config.use_server_cache_policy,
            "image loader ready"
        );

        Ok(ImageLoader {
            inner: Arc::new(LoaderInner {
                policy: config.policy(),
                memory: MemoryCache::new(config.memory_max_bytes),
                disk,
                transport,
                registry: InFlightRegistry::new(),
                authorization: RwLock::new(authorization),
                clock: self.clock,
                config,
            }),
        })
    }
}

impl ImageLoader {
    pub fn builder(config: AppConfig) -> ImageLoaderBuilder {
        ImageLoaderBuilder { config, transport: None, clock: Arc::new(SystemClock) }
    }

    /// Loader with the production transport.
    ///
    /// # Errors
    ///
    /// See [`ImageLoaderBuilder::build`].
    pub async fn new(config: AppConfig) -> Result<Self, SetupError> {
        Self::builder(config).build().await
    }

    /// Loader that sends requests through `transport`.
    ///
    /// # Errors
    ///
    /// See [`ImageLoaderBuilder::build`].
    pub async fn with_transport(config: AppConfig, transport: Arc<dyn HttpTransport>) -> Result<Self, SetupError> {
        Self::builder(config).transport(transport).build().await
    }

    /// The process-wide loader, created from `AppConfig::load()` on first use.
    ///
    /// # Errors
    ///
    /// Returns `SetupError` if configuration loading or setup fails; the
    /// next call tries again.
    pub async fn shared() -> Result<Self, SetupError> {
        let mut shared = SHARED.lock().await;
        if let Some(loader) = shared.as_ref() {
            return Ok(loader.clone());
        }
        let loader = Self::new(AppConfig::load()?).await?;
        *shared = Some(loader.clone());
        Ok(loader)
    }

    /// Forget the process-wide loader. Existing clones keep working.
    pub async fn reset_shared() {
        SHARED.lock().await.take();
    }

    /// Three-phase load. Returns immediately; progress arrives on the handle.
    pub fn load(&self, request: impl Into<ImageRequest>) -> LoadHandle {
        let (events, receiver) = mpsc::unbounded_channel();
        let control = NetworkControl::default();
        let run = pipeline::Run {
            inner: Arc::clone(&self.inner),
            variant: Variant::Loader,
            control: control.clone(),
            events: Some(events),
        };
        let request = request.into();

        tokio::spawn(async move {
            let result = run.execute(request).await.map(|done| LoadedImage { image: done.image, source: done.source });
            run.control.finish();
            run.emit(LoadEvent::Completed(result));
        });

        LoadHandle::new(receiver, control)
    }

    /// Disk-cache load. Resolves once, with the payload's location on disk.
    pub fn cache_image(&self, request: impl Into<ImageRequest>) -> CacheTask {
        let control = NetworkControl::default();
        let run = pipeline::Run {
            inner: Arc::clone(&self.inner),
            variant: Variant::DiskCache,
            control: control.clone(),
            events: None,
        };
        let request = request.into();

        let task = tokio::spawn(async move {
            let result = run.execute(request).await.map(|done| CachedImage {
                image: done.image,
                url: done.url,
                path: done.path,
                source: done.source,
            });
            run.control.finish();
            result
        });

        CacheTask::new(task, control)
    }

    /// Set or clear the credentials sent as `Authorization: Basic` on
    /// every request. Both halves are required to set them.
    pub fn set_auth(&self, username: Option<&str>, password: Option<&str>) {
        *self.inner.authorization.write() = basic_authorization(username, password);
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn memory_cache(&self) -> &MemoryCache {
        &self.inner.memory
    }

    pub fn disk_store(&self) -> &DiskStore {
        &self.inner.disk
    }

    pub fn purge_memory(&self) {
        self.inner.memory.purge();
    }

    /// Coalescing counters for this loader's network requests.
    pub fn request_stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.registry.in_flight_count()
    }

    /// Delete cached files older than `age`, regardless of cache policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be listed.
    pub async fn clear_cached_files_older_than(&self, age: Duration) -> Result<usize, pixcache_core::Error> {
        self.inner.disk.purge_older_than(age).await
    }

    /// # Errors
    ///
    /// See [`ImageLoader::clear_cached_files_older_than`].
    pub async fn clear_cached_files_older_than_1_day(&self) -> Result<usize, pixcache_core::Error> {
        self.clear_cached_files_older_than(ONE_DAY).await
    }

    /// # Errors
    ///
    /// See [`ImageLoader::clear_cached_files_older_than`].
    pub async fn clear_cached_files_older_than_1_week(&self) -> Result<usize, pixcache_core::Error> {
        self.clear_cached_files_older_than(ONE_WEEK).await
    }
}
