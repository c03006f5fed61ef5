//! Coalescing fetch manager.
//!
//! Many watch streams follow the same resource set (every device agent in
//! an organization watches that organization's devices). Once they reach
//! the tail they all wake on the same signal and ask for the same
//! `revision > gt` page. The fetch manager keeps a per-key tail cache so
//! that one loader call serves all of them.
//!
//! A [`Fetcher`] starts in direct mode and calls the loader until it gets
//! an empty page (it reached the tail). From then on it reads the shared
//! tail cache. When the cache has nothing new, fetchers race to fill it:
//! the first one calls the loader under the cache's fill lock, the rest
//! find the cache moved on and re-read it. A fetcher that finds a gap
//! between its revision and the cache (it fell behind) goes back to direct
//! mode.
//!
//! Fills that load nothing still count. A fetcher whose last signal was
//! raised before an empty fill for the same revision started takes that
//! empty result instead of asking the loader again.
//!
//! Backends:
//! - passthrough - no cache, every fetch calls the loader
//! - [`MemTailCache`] - per-process ring buffer
//! - [`SharedTailCache`] - SQL table shared by every replica

mod mem;
mod shared;

pub use mem::MemTailCache;
pub use shared::{is_postgres_url, CachePool, SharedCacheOptions, SharedTailCache};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use sync_types::{ResourceList, Revision};

use crate::config::{Config, ConfigError, FetchManagerKind};
use crate::error::{FetchError, FetchResult, ServerError};

/// Reads one page of a resource set.
///
/// Returns items with `revision > gt`, ordered by revision ascending and
/// limited to a page.
pub trait Loader: Send + Sync {
    /// Load the page after `gt`.
    fn load(&self, gt: Revision) -> BoxFuture<'_, FetchResult<ResourceList>>;
}

impl<F, Fut> Loader for F
where
    F: Fn(Revision) -> Fut + Send + Sync,
    Fut: Future<Output = FetchResult<ResourceList>> + Send + 'static,
{
    fn load(&self, gt: Revision) -> BoxFuture<'_, FetchResult<ResourceList>> {
        Box::pin(self(gt))
    }
}

/// Per-fetcher position in a tail cache.
#[derive(Debug, Clone, Default)]
pub struct TailCursor {
    /// Whether the fetcher reads the tail cache instead of the loader.
    pub from_tail: bool,
    /// Next ring position to read (memory backend only).
    pub read_pos: u64,
}

/// Backend of a tail cache.
#[async_trait]
pub trait TailCache: Send + Sync {
    /// Read cached items after `gt`.
    ///
    /// Returns the items and a fill mark to hand to [`TailCache::fill`].
    /// Clears `cursor.from_tail` when the cache cannot serve `gt`.
    async fn read(&self, cursor: &mut TailCursor, gt: Revision) -> (ResourceList, u64);

    /// Load the page after `gt` into the cache.
    ///
    /// Returns `Ok(None)` when another fetcher filled the cache since the
    /// read that produced `mark`, even if that fill loaded nothing; the
    /// caller should read again.
    async fn fill(
        &self,
        cursor: &mut TailCursor,
        loader: &dyn Loader,
        gt: Revision,
        mark: u64,
    ) -> FetchResult<Option<ResourceList>>;
}

enum Backend {
    Passthrough,
    Memory,
    Shared(SharedCacheOptions),
}

/// A keyed cache plus the last fill that found nothing new.
struct TailState {
    cache: Box<dyn TailCache>,
    /// Held across a fill and its bookkeeping.
    fill_lock: tokio::sync::Mutex<()>,
    /// Revision and start time of the latest fill, if it loaded nothing.
    last_empty: Mutex<Option<(Revision, Instant)>>,
}

impl TailState {
    fn new(cache: Box<dyn TailCache>) -> Self {
        Self {
            cache,
            fill_lock: tokio::sync::Mutex::new(()),
            last_empty: Mutex::new(None),
        }
    }

    /// Whether a fill for `gt` that started at or after `since` came back empty.
    fn empty_since(&self, gt: Revision, since: Instant) -> bool {
        matches!(*self.last_empty.lock(), Some((at, started)) if at == gt && started >= since)
    }

    fn record_fill(&self, gt: Revision, started: Instant, items: &ResourceList) {
        *self.last_empty.lock() = items.is_empty().then_some((gt, started));
    }
}

struct CacheEntry {
    tail: Arc<TailState>,
    open: usize,
}

struct ManagerInner {
    backend: Backend,
    caches: Mutex<HashMap<String, CacheEntry>>,
}

/// Keyed, reference counted tail caches.
///
/// Cheap to clone; clones share the same caches.
#[derive(Clone)]
pub struct FetchManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for FetchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.inner.backend {
            Backend::Passthrough => "none",
            Backend::Memory => "memory",
            Backend::Shared(_) => "shared",
        };
        f.debug_struct("FetchManager")
            .field("backend", &backend)
            .field("caches", &self.cache_count())
            .finish()
    }
}

impl FetchManager {
    fn with_backend(backend: Backend) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                backend,
                caches: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Every fetch calls the loader.
    pub fn passthrough() -> Self {
        Self::with_backend(Backend::Passthrough)
    }

    /// Per-process ring buffer caches.
    pub fn memory() -> Self {
        Self::with_backend(Backend::Memory)
    }

    /// Caches in a table shared by every replica.
    pub fn shared(options: SharedCacheOptions) -> Self {
        Self::with_backend(Backend::Shared(options))
    }

    /// Build the manager selected by configuration.
    ///
    /// The shared backend uses `fetch.shared_url`, or else the clustered
    /// signal bus database.
    pub async fn from_config(config: &Config) -> Result<Self, ServerError> {
        let fetch = &config.fetch;
        match fetch.manager {
            FetchManagerKind::None => Ok(Self::passthrough()),
            FetchManagerKind::Memory => Ok(Self::memory()),
            FetchManagerKind::Shared => {
                let url = config.shared_cache_url().ok_or(ConfigError::Missing {
                    field: "fetch.shared_url",
                })?;
                let pool = shared::open_pool(url).await?;
                if !matches!(pool, CachePool::Postgres(_)) {
                    tracing::warn!(
                        "shared fetch cache is not on Postgres; replicas on other hosts cannot use it"
                    );
                }
                Ok(Self::shared(SharedCacheOptions {
                    pool,
                    key_prefix: fetch.key_prefix.clone(),
                    timeout: fetch.timeout(),
                }))
            }
        }
    }

    /// Open a fetcher on `key`.
    ///
    /// Fetchers on the same key share one cache of `limit` items, created
    /// by the first open and released by the last close.
    pub fn open(&self, key: &str, limit: usize, loader: Arc<dyn Loader>) -> Fetcher {
        let tail = match &self.inner.backend {
            Backend::Passthrough => None,
            Backend::Memory | Backend::Shared(_) => {
                let mut caches = self.inner.caches.lock();
                let entry = caches.entry(key.to_string()).or_insert_with(|| {
                    tracing::debug!(key, limit, "creating fetch cache");
                    CacheEntry {
                        tail: Arc::new(TailState::new(self.new_cache(key, limit))),
                        open: 0,
                    }
                });
                entry.open += 1;
                Some(Arc::clone(&entry.tail))
            }
        };
        Fetcher {
            key: key.to_string(),
            manager: Arc::clone(&self.inner),
            tail,
            loader,
            cursor: TailCursor::default(),
            signaled_at: Instant::now(),
            closed: false,
        }
    }

    fn new_cache(&self, key: &str, limit: usize) -> Box<dyn TailCache> {
        match &self.inner.backend {
            Backend::Shared(options) => Box::new(SharedTailCache::new(options.clone(), key, limit)),
            _ => Box::new(MemTailCache::new(limit)),
        }
    }

    /// Number of keys with an open cache.
    pub fn cache_count(&self) -> usize {
        self.inner.caches.lock().len()
    }

    /// Number of open fetchers on `key`.
    pub fn open_count(&self, key: &str) -> usize {
        self.inner
            .caches
            .lock()
            .get(key)
            .map(|entry| entry.open)
            .unwrap_or(0)
    }
}

/// One consumer's handle on a keyed cache.
pub struct Fetcher {
    key: String,
    manager: Arc<ManagerInner>,
    tail: Option<Arc<TailState>>,
    loader: Arc<dyn Loader>,
    cursor: TailCursor,
    /// When the consumer's latest signal was raised.
    signaled_at: Instant,
    closed: bool,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("key", &self.key)
            .field("cursor", &self.cursor)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Fetcher {
    /// The cache key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether fetches are served from the tail cache.
    pub fn is_at_tail(&self) -> bool {
        self.cursor.from_tail
    }

    /// Record when the consumer's latest signal was raised.
    ///
    /// Empty fills that started before `at` no longer answer this fetcher:
    /// the change behind the signal may postdate them.
    pub fn signaled_at(&mut self, at: Instant) {
        self.signaled_at = self.signaled_at.max(at);
    }

    /// Fetch items with `revision > gt`.
    ///
    /// Loader errors are returned verbatim and nothing is cached for them.
    pub async fn fetch(&mut self, gt: Revision) -> FetchResult<ResourceList> {
        if self.closed {
            return Err(FetchError::Closed);
        }

        if let Some(tail) = self.tail.clone() {
            while self.cursor.from_tail {
                let (items, mark) = tail.cache.read(&mut self.cursor, gt).await;
                if !items.is_empty() {
                    return Ok(items);
                }
                // Fell behind the cache.
                if !self.cursor.from_tail {
                    tracing::debug!(key = %self.key, %gt, "fetcher fell behind tail cache");
                    break;
                }
                let _fill = tail.fill_lock.lock().await;
                if tail.empty_since(gt, self.signaled_at) {
                    tracing::trace!(key = %self.key, %gt, "joined empty tail fill");
                    return Ok(Vec::new());
                }
                let started = Instant::now();
                if let Some(items) = tail
                    .cache
                    .fill(&mut self.cursor, self.loader.as_ref(), gt, mark)
                    .await?
                {
                    tail.record_fill(gt, started, &items);
                    return Ok(items);
                }
                // Another fetcher filled the cache; read what it loaded.
            }
        }

        let items = self.loader.load(gt).await?;
        if items.is_empty() && self.tail.is_some() {
            self.cursor.from_tail = true;
        }
        Ok(items)
    }

    /// Release the fetcher's hold on its cache. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.tail.take().is_none() {
            return;
        }
        let mut caches = self.manager.caches.lock();
        if let Some(entry) = caches.get_mut(&self.key) {
            entry.open = entry.open.saturating_sub(1);
            if entry.open == 0 {
                caches.remove(&self.key);
                tracing::debug!(key = %self.key, "released fetch cache");
            }
        }
    }
}

impl Drop for Fetcher {
    fn drop(&mut self) {
        self.close();
    }
}
