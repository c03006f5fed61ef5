//! Main sync server coordination.
//!
//! SyncServer owns the storage, the signal bus and the fetch manager, and
//! wires them together: mutations notify after commit, watch streams
//! subscribe and fetch.

use crate::config::{Config, ConfigError, SignalBusMode};
use crate::error::{Result, StorageResult};
use crate::fetchmgr::FetchManager;
use crate::limits::RateLimits;
use crate::signalbus::{MemSignalBus, PgSignalBus, SignalBus};
use crate::storage::{PutResource, ResourceQuery, ResourceStorage, SqliteStorage};
use crate::watch::{storage_loader, KindWatch, ResourceKind, WatchDispatcher, WatchSource};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_types::{ApiError, Resource, Revision, Watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Operational metrics for monitoring watch activity.
///
/// Counters are monotonically increasing (reset only on restart);
/// `watch_streams_active` is a gauge.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Watch streams currently open.
    pub watch_streams_active: AtomicU64,
    /// Total watch streams opened.
    pub watch_streams_total: AtomicU64,
    /// Total events written to watch streams.
    pub events_sent: AtomicU64,
    /// Total loader calls (pages read from storage for watchers).
    pub loader_calls: AtomicU64,
    /// Total signals notified after mutations.
    pub notifications_published: AtomicU64,
    /// Total rate limit rejections (organization + global).
    pub rate_limit_hits: AtomicU64,
    /// Total request and stream errors.
    pub errors_total: AtomicU64,
}

/// Options of a single-resource watch opened from a list request.
#[derive(Debug, Clone, Default)]
pub struct ListWatch {
    /// Last revision the client has seen.
    pub gt_revision: Revision,
    /// Whether the client already holds the complete list.
    pub at_tail: bool,
    /// Name prefixes to follow (metadata only).
    pub prefixes: Vec<String>,
}

/// Main API server state.
pub struct SyncServer {
    config: Config,
    storage: Arc<dyn ResourceStorage>,
    bus: Arc<dyn SignalBus>,
    fetch: FetchManager,
    /// Rate limiters for watch opens and global requests.
    rate_limits: RateLimits,
    /// Operational metrics (counters, gauges).
    metrics: Arc<ServerMetrics>,
    /// Parent of every watch stream's cancellation.
    shutdown: CancellationToken,
    started_at: Instant,
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.config)
            .field("fetch", &self.fetch)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl SyncServer {
    /// Create a server from its parts.
    pub fn new(
        config: Config,
        storage: Arc<dyn ResourceStorage>,
        bus: Arc<dyn SignalBus>,
        fetch: FetchManager,
        shutdown: CancellationToken,
    ) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        Self {
            config,
            storage,
            bus,
            fetch,
            rate_limits,
            metrics: Arc::new(ServerMetrics::default()),
            shutdown,
            started_at: Instant::now(),
        }
    }

    /// Open the storage, signal bus and fetch manager selected by `config`.
    pub async fn from_config(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let storage = SqliteStorage::new(&config.storage.database).await?;
        tracing::info!(database = %config.storage.database.display(), "storage opened");

        let bus: Arc<dyn SignalBus> = match config.signalbus.mode {
            SignalBusMode::Memory => Arc::new(MemSignalBus::new()),
            SignalBusMode::Postgres => {
                let url = config
                    .signalbus
                    .database_url
                    .as_deref()
                    .ok_or(ConfigError::Missing {
                        field: "signalbus.database_url",
                    })?;
                Arc::new(PgSignalBus::connect(
                    url,
                    &config.signalbus,
                    shutdown.child_token(),
                )?)
            }
        };
        tracing::info!(mode = ?config.signalbus.mode, "signal bus started");

        let fetch = FetchManager::from_config(&config).await?;
        tracing::info!(?fetch, "fetch manager ready");

        Ok(Self::new(config, Arc::new(storage), bus, fetch, shutdown))
    }

    /// Get the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the storage layer.
    pub fn storage(&self) -> &dyn ResourceStorage {
        self.storage.as_ref()
    }

    /// Get access to the signal bus.
    pub fn bus(&self) -> &dyn SignalBus {
        self.bus.as_ref()
    }

    /// Get access to the fetch manager.
    pub fn fetch_manager(&self) -> &FetchManager {
        &self.fetch
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Time since this server was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Token cancelled on shutdown.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Open a multi-kind watch stream for `organization`.
    ///
    /// Fails on the first request entry with an unknown kind or malformed
    /// options, naming the offending field.
    pub fn open_watches(
        &self,
        organization: Uuid,
        watches: &[Watch],
    ) -> std::result::Result<WatchDispatcher, ApiError> {
        let mut kinds = Vec::with_capacity(watches.len());
        for (i, watch) in watches.iter().enumerate() {
            let kind = ResourceKind::from_name(&watch.kind)
                .ok_or_else(|| ApiError::invalid_field(format!("request[{i}].kind")))?;
            let prefixes = match kind {
                ResourceKind::DeviceMetadata => {
                    watch.string_list_option("prefixes").map_err(|_| {
                        ApiError::invalid_field(format!("request[{i}].options.prefixes"))
                    })?
                }
                _ => Vec::new(),
            };
            kinds.push(self.kind_watch(
                organization,
                kind,
                watch.gt_revision,
                watch.at_tail,
                prefixes,
                true,
            ));
        }

        tracing::debug!(%organization, kinds = kinds.len(), "watch opened");
        Ok(WatchDispatcher::new(
            kinds,
            self.shutdown.child_token(),
            self.config.watch.idle_timeout(),
        ))
    }

    /// Open a single-kind watch stream that reads storage directly.
    pub fn open_list_watch(
        &self,
        organization: Uuid,
        kind: ResourceKind,
        options: ListWatch,
    ) -> WatchDispatcher {
        let watch = self.kind_watch(
            organization,
            kind,
            options.gt_revision,
            options.at_tail,
            options.prefixes,
            false,
        );
        WatchDispatcher::new(
            vec![watch],
            self.shutdown.child_token(),
            self.config.watch.idle_timeout(),
        )
    }

    fn kind_watch(
        &self,
        organization: Uuid,
        kind: ResourceKind,
        gt_revision: Revision,
        at_tail: bool,
        prefixes: Vec<String>,
        shared: bool,
    ) -> KindWatch {
        let signal = kind.signal(&organization);
        // Subscribe before the first fetch so no notify falls in between.
        let subscription = self.bus.subscribe(&signal);

        let query = ResourceQuery::new(kind.name(), organization).with_prefixes(prefixes);
        let loader = storage_loader(
            Arc::clone(&self.storage),
            query,
            self.config.storage.page_size,
            Arc::clone(&self.metrics),
        );

        let source = match kind.cache_key(&organization) {
            Some(key) if shared => WatchSource::Cached(self.fetch.open(
                &key,
                self.config.fetch.device_cache_size,
                loader,
            )),
            _ => WatchSource::Direct(loader),
        };

        KindWatch::new(kind.name(), gt_revision, at_tail, source, subscription)
    }

    /// Create or update a resource, then wake its watchers.
    pub async fn put_resource(
        &self,
        kind: ResourceKind,
        organization: Uuid,
        id: Uuid,
        name: String,
        body: serde_json::Value,
    ) -> StorageResult<Resource> {
        let resource = self
            .storage
            .put_resource(PutResource {
                id,
                kind: kind.name().to_string(),
                organization_id: organization,
                name,
                body,
            })
            .await?;
        self.notify(kind, &organization);
        Ok(resource)
    }

    /// Soft delete a resource, then wake its watchers.
    pub async fn delete_resource(
        &self,
        kind: ResourceKind,
        organization: Uuid,
        id: Uuid,
    ) -> StorageResult<Resource> {
        let resource = self
            .storage
            .delete_resource(kind.name(), &organization, &id)
            .await?;
        self.notify(kind, &organization);
        Ok(resource)
    }

    fn notify(&self, kind: ResourceKind, organization: &Uuid) {
        let signal = kind.signal(organization);
        tracing::debug!(%signal, "notify");
        self.bus.notify(&signal);
        self.metrics
            .notifications_published
            .fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{EventType, WatchEvent};

    async fn test_server() -> SyncServer {
        let storage = SqliteStorage::in_memory().await.unwrap();
        SyncServer::new(
            Config::default(),
            Arc::new(storage),
            Arc::new(MemSignalBus::new()),
            FetchManager::memory(),
            CancellationToken::new(),
        )
    }

    async fn next(dispatcher: &mut WatchDispatcher) -> WatchEvent {
        tokio::time::timeout(Duration::from_secs(2), dispatcher.next_event())
            .await
            .expect("watch stalled")
            .expect("watch finished")
    }

    #[tokio::test]
    async fn uptime_is_per_server() {
        let first = test_server().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = test_server().await;

        assert!(first.uptime() >= Duration::from_millis(30));
        assert!(second.uptime() < first.uptime());
    }

    #[tokio::test]
    async fn device_watch_sees_insert_and_delete() {
        let server = test_server().await;
        let org = Uuid::new_v4();
        let mut dispatcher = server
            .open_watches(org, &[Watch::new("device")])
            .unwrap();

        let tail = next(&mut dispatcher).await;
        assert_eq!(tail.event_type, EventType::Tail);
        assert_eq!(tail.marker_revision(), Some(Revision::zero()));

        let id = Uuid::new_v4();
        server
            .put_resource(
                ResourceKind::Device,
                org,
                id,
                "laptop".into(),
                serde_json::json!({ "public_key": "abc" }),
            )
            .await
            .unwrap();

        let change = next(&mut dispatcher).await;
        assert_eq!(change.event_type, EventType::Change);
        assert_eq!(change.kind, "device");
        let value = change.value.unwrap();
        assert_eq!(value["name"], "laptop");
        let r1 = value["revision"].as_u64().unwrap();

        let bookmark = next(&mut dispatcher).await;
        assert_eq!(bookmark.event_type, EventType::Bookmark);
        assert_eq!(bookmark.marker_revision(), Some(Revision::new(r1)));

        server
            .delete_resource(ResourceKind::Device, org, id)
            .await
            .unwrap();
        let delete = next(&mut dispatcher).await;
        assert_eq!(delete.event_type, EventType::Delete);
        let r2 = delete.value.unwrap()["revision"].as_u64().unwrap();
        assert!(r2 > r1);
        assert_eq!(server.metrics().notifications_published.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn other_organizations_are_not_woken() {
        let server = test_server().await;
        let org = Uuid::new_v4();
        let mut dispatcher = server
            .open_watches(org, &[Watch::new("security-group")])
            .unwrap();
        assert_eq!(next(&mut dispatcher).await.event_type, EventType::Tail);

        server
            .put_resource(
                ResourceKind::SecurityGroup,
                Uuid::new_v4(),
                Uuid::new_v4(),
                "default".into(),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let quiet = tokio::time::timeout(Duration::from_millis(200), dispatcher.next_event()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn resume_skips_seen_revisions() {
        let server = test_server().await;
        let org = Uuid::new_v4();
        for name in ["a", "b", "c"] {
            server
                .put_resource(
                    ResourceKind::Device,
                    org,
                    Uuid::new_v4(),
                    name.into(),
                    serde_json::json!({}),
                )
                .await
                .unwrap();
        }

        let mut dispatcher = server
            .open_watches(org, &[Watch::new("device").after(Revision::new(2))])
            .unwrap();
        let change = next(&mut dispatcher).await;
        assert_eq!(change.value.unwrap()["name"], "c");
        assert_eq!(next(&mut dispatcher).await.event_type, EventType::Tail);
    }

    #[tokio::test]
    async fn metadata_watch_filters_prefixes() {
        let server = test_server().await;
        let org = Uuid::new_v4();
        for name in ["tcp:22", "udp:53"] {
            server
                .put_resource(
                    ResourceKind::DeviceMetadata,
                    org,
                    Uuid::new_v4(),
                    name.into(),
                    serde_json::json!({}),
                )
                .await
                .unwrap();
        }

        let mut watch = Watch::new("device-metadata");
        watch.options =
            serde_json::from_value(serde_json::json!({ "prefixes": ["tcp:"] })).unwrap();
        let mut dispatcher = server.open_watches(org, &[watch]).unwrap();

        let change = next(&mut dispatcher).await;
        assert_eq!(change.value.unwrap()["name"], "tcp:22");
        assert_eq!(next(&mut dispatcher).await.event_type, EventType::Tail);
    }

    #[tokio::test]
    async fn unknown_kind_names_the_request_index() {
        let server = test_server().await;
        let err = server
            .open_watches(Uuid::new_v4(), &[Watch::new("device"), Watch::new("widget")])
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("request[1].kind"));
        // The device watch opened before the failure released its fetcher.
        assert_eq!(server.fetch_manager().cache_count(), 0);
    }

    #[tokio::test]
    async fn malformed_prefixes_are_rejected() {
        let server = test_server().await;
        let mut watch = Watch::new("device-metadata");
        watch.options = serde_json::from_value(serde_json::json!({ "prefixes": [1, 2] })).unwrap();
        let err = server.open_watches(Uuid::new_v4(), &[watch]).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("request[0].options.prefixes"));
    }

    #[tokio::test]
    async fn device_watchers_share_one_cache() {
        let server = test_server().await;
        let org = Uuid::new_v4();
        let a = server.open_watches(org, &[Watch::new("device")]).unwrap();
        let b = server.open_watches(org, &[Watch::new("device")]).unwrap();
        let key = format!("org-devices:{org}");
        assert_eq!(server.fetch_manager().open_count(&key), 2);

        drop(a);
        drop(b);
        assert_eq!(server.fetch_manager().cache_count(), 0);
    }

    #[tokio::test]
    async fn parked_device_watchers_share_loads() {
        const WATCHERS: usize = 20;
        let server = test_server().await;
        let org = Uuid::new_v4();

        let mut watchers = Vec::with_capacity(WATCHERS);
        for _ in 0..WATCHERS {
            let mut dispatcher = server.open_watches(org, &[Watch::new("device")]).unwrap();
            assert_eq!(next(&mut dispatcher).await.event_type, EventType::Tail);
            watchers.push(tokio::spawn(async move {
                let change = next(&mut dispatcher).await;
                let bookmark = next(&mut dispatcher).await;
                (change, bookmark)
            }));
        }
        // Every watcher parks on its signal.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = server.metrics().loader_calls.load(Ordering::Relaxed);

        server
            .put_resource(
                ResourceKind::Device,
                org,
                Uuid::new_v4(),
                "laptop".into(),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        for watcher in watchers {
            let (change, bookmark) = watcher.await.unwrap();
            assert_eq!(change.event_type, EventType::Change);
            assert_eq!(change.value.unwrap()["name"], "laptop");
            assert_eq!(bookmark.event_type, EventType::Bookmark);
        }
        // One load finds the new device, one finds nothing after it.
        let loads = server.metrics().loader_calls.load(Ordering::Relaxed) - before;
        assert_eq!(loads, 2);
    }

    #[tokio::test]
    async fn list_watch_reads_storage_directly() {
        let server = test_server().await;
        let org = Uuid::new_v4();
        let mut dispatcher =
            server.open_list_watch(org, ResourceKind::Device, ListWatch::default());
        assert_eq!(server.fetch_manager().cache_count(), 0);
        assert_eq!(next(&mut dispatcher).await.event_type, EventType::Tail);
    }

    #[tokio::test]
    async fn shutdown_closes_open_watches() {
        let server = test_server().await;
        let mut dispatcher = server
            .open_watches(Uuid::new_v4(), &[Watch::new("device")])
            .unwrap();
        assert_eq!(next(&mut dispatcher).await.event_type, EventType::Tail);

        server.shutdown_token().cancel();
        assert_eq!(next(&mut dispatcher).await.event_type, EventType::Close);
    }
}
