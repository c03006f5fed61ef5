//! Multiplexes the watched kinds of one connection into a single event
//! sequence.

use futures_util::future::{select_all, BoxFuture};
use futures_util::FutureExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_core::{KindCursor, KindEvent, Step};
use sync_types::{EventType, ResourceItem, ResourceList, Revision, WatchEvent};
use tokio_util::sync::CancellationToken;

use crate::error::{FetchError, FetchResult};
use crate::fetchmgr::{Fetcher, Loader};
use crate::signalbus::Subscription;

/// Where a watched kind reads its pages from.
pub enum WatchSource {
    /// Shared through the fetch manager.
    Cached(Fetcher),
    /// Straight from the loader.
    Direct(Arc<dyn Loader>),
}

impl WatchSource {
    async fn fetch(&mut self, gt: Revision) -> FetchResult<ResourceList> {
        match self {
            Self::Cached(fetcher) => fetcher.fetch(gt).await,
            Self::Direct(loader) => loader.load(gt).await,
        }
    }

    fn signaled_at(&mut self, at: Instant) {
        if let Self::Cached(fetcher) = self {
            fetcher.signaled_at(at);
        }
    }

    fn close(&mut self) {
        if let Self::Cached(fetcher) = self {
            fetcher.close();
        }
    }
}

impl std::fmt::Debug for WatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cached(fetcher) => f.debug_tuple("Cached").field(fetcher).finish(),
            Self::Direct(_) => f.write_str("Direct"),
        }
    }
}

/// One watched kind of a connection.
#[derive(Debug)]
pub struct KindWatch {
    kind: String,
    cursor: KindCursor<ResourceItem>,
    source: WatchSource,
    subscription: Subscription,
}

impl KindWatch {
    /// Watch `kind` after `gt_revision`, waking on `subscription`.
    pub fn new(
        kind: impl Into<String>,
        gt_revision: Revision,
        at_tail: bool,
        source: WatchSource,
        subscription: Subscription,
    ) -> Self {
        Self {
            kind: kind.into(),
            cursor: KindCursor::new(gt_revision, at_tail),
            source,
            subscription,
        }
    }

    /// The watched kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Revision of the last event emitted for this kind.
    pub fn gt_revision(&self) -> Revision {
        self.cursor.gt_revision()
    }

    fn render(&self, event: KindEvent<ResourceItem>) -> WatchEvent {
        match event {
            KindEvent::Change(item) => WatchEvent::change(&self.kind, item.value),
            KindEvent::Delete(item) => WatchEvent::delete(&self.kind, item.value),
            KindEvent::Tail(revision) => WatchEvent::marker(&self.kind, EventType::Tail, revision),
            KindEvent::Bookmark(revision) => {
                WatchEvent::marker(&self.kind, EventType::Bookmark, revision)
            }
        }
    }

    /// The kind's signal fired.
    fn wake(&mut self) {
        self.cursor.wake();
        let at = self.subscription.notified_at().unwrap_or_else(Instant::now);
        self.source.signaled_at(at);
    }

    fn close(&mut self) {
        self.subscription.close();
        self.source.close();
    }
}

enum Poll {
    Event(WatchEvent),
    Waiting,
    Cancelled,
    Failed(FetchError),
}

/// Event loop of one watch connection.
///
/// Kinds are served round robin. A kind with buffered items emits one per
/// turn, a kind without fetches, and a kind at the tail parks until its
/// signal fires. When every kind is parked the dispatcher sleeps on all
/// subscriptions at once, bounded by the idle timeout.
#[derive(Debug)]
pub struct WatchDispatcher {
    kinds: Vec<KindWatch>,
    next: usize,
    cancel: CancellationToken,
    idle_timeout: Duration,
    finished: bool,
}

impl WatchDispatcher {
    /// Dispatch `kinds` until `cancel` fires or a fetch fails.
    pub fn new(kinds: Vec<KindWatch>, cancel: CancellationToken, idle_timeout: Duration) -> Self {
        Self {
            kinds,
            next: 0,
            cancel,
            idle_timeout,
            finished: false,
        }
    }

    /// Number of kinds still being watched.
    pub fn kind_count(&self) -> usize {
        self.kinds.len()
    }

    /// Whether a terminal event was returned.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Produce the next event.
    ///
    /// Returns `None` once a terminal `error` or `close` event was
    /// returned. Cancellation is observed while fetching and while waiting.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        if self.finished {
            return None;
        }
        if self.kinds.is_empty() {
            return Some(self.finish(WatchEvent::close()));
        }

        loop {
            if self.cancel.is_cancelled() {
                return Some(self.finish(WatchEvent::close()));
            }

            for _ in 0..self.kinds.len() {
                let index = self.next;
                self.next = (index + 1) % self.kinds.len();
                match self.poll_kind(index).await {
                    Poll::Event(event) => return Some(event),
                    Poll::Waiting => {}
                    Poll::Cancelled => return Some(self.finish(WatchEvent::close())),
                    Poll::Failed(err) => {
                        tracing::error!(
                            kind = %self.kinds[index].kind,
                            error = %err,
                            "watch fetch failed"
                        );
                        return Some(self.finish(WatchEvent::error(err.to_string())));
                    }
                }
            }

            // Every kind is parked.
            if !self.wait_for_signal().await {
                return Some(self.finish(WatchEvent::close()));
            }
        }
    }

    async fn poll_kind(&mut self, index: usize) -> Poll {
        let cancel = self.cancel.clone();
        let watch = &mut self.kinds[index];

        let mut step = watch.cursor.step();
        if matches!(step, Step::Parked) {
            if !watch.subscription.is_signaled() {
                return Poll::Waiting;
            }
            watch.wake();
            step = watch.cursor.step();
        }

        match step {
            Step::Emit(event) => Poll::Event(watch.render(event)),
            Step::Parked => Poll::Waiting,
            Step::Fetch(gt) => {
                let fetched = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = watch.source.fetch(gt) => Some(result),
                };
                match fetched {
                    None => Poll::Cancelled,
                    Some(Err(err)) => Poll::Failed(err),
                    Some(Ok(items)) => {
                        tracing::debug!(
                            kind = %watch.kind,
                            %gt,
                            items = items.len(),
                            "watch fetched"
                        );
                        match watch.cursor.on_fetched(items) {
                            Some(event) => Poll::Event(watch.render(event)),
                            None => Poll::Waiting,
                        }
                    }
                }
            }
        }
    }

    /// Block until a subscription fires, the idle timeout passes, or the
    /// dispatcher is cancelled. Returns `false` on cancellation.
    async fn wait_for_signal(&mut self) -> bool {
        let cancel = self.cancel.clone();
        let idle = tokio::time::sleep(self.idle_timeout);

        let woken = {
            let waits: Vec<BoxFuture<'_, usize>> = self
                .kinds
                .iter_mut()
                .enumerate()
                .map(|(index, watch)| {
                    async move {
                        watch.subscription.signaled().await;
                        index
                    }
                    .boxed()
                })
                .collect();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                (index, _, _) = select_all(waits) => Some(index),
                _ = idle => None,
            }
        };

        match woken {
            Some(index) => self.kinds[index].wake(),
            None => tracing::trace!("watch idle timeout"),
        }
        true
    }

    fn finish(&mut self, event: WatchEvent) -> WatchEvent {
        self.finished = true;
        self.close();
        event
    }

    /// Release every subscription and fetcher. Idempotent.
    pub fn close(&mut self) {
        for watch in &mut self.kinds {
            watch.close();
        }
        self.kinds.clear();
    }
}

impl Drop for WatchDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetchmgr::FetchManager;
    use crate::signalbus::{MemSignalBus, SignalBus};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn item(revision: u64) -> ResourceItem {
        ResourceItem::new(serde_json::json!({ "rev": revision }), Revision::new(revision))
    }

    /// Loader over a mutable list of items.
    fn shared_loader(items: Arc<Mutex<Vec<ResourceItem>>>) -> Arc<dyn Loader> {
        Arc::new(move |gt: Revision| {
            let page: ResourceList = items
                .lock()
                .iter()
                .filter(|i| i.revision > gt)
                .cloned()
                .collect();
            async move { Ok::<_, FetchError>(page) }
        })
    }

    async fn next(dispatcher: &mut WatchDispatcher) -> WatchEvent {
        tokio::time::timeout(Duration::from_secs(2), dispatcher.next_event())
            .await
            .expect("dispatcher stalled")
            .expect("dispatcher finished")
    }

    #[tokio::test]
    async fn emits_items_then_tail_then_parks() {
        let bus = MemSignalBus::new();
        let items = Arc::new(Mutex::new(vec![item(1), item(2)]));
        let watch = KindWatch::new(
            "device",
            Revision::zero(),
            false,
            WatchSource::Direct(shared_loader(items.clone())),
            bus.subscribe("s"),
        );
        let mut dispatcher =
            WatchDispatcher::new(vec![watch], CancellationToken::new(), Duration::from_secs(30));

        assert_eq!(next(&mut dispatcher).await.event_type, EventType::Change);
        assert_eq!(next(&mut dispatcher).await.event_type, EventType::Change);
        let tail = next(&mut dispatcher).await;
        assert_eq!(tail.event_type, EventType::Tail);
        assert_eq!(tail.marker_revision(), Some(Revision::new(2)));

        // Parked: nothing arrives without a signal.
        let idle = tokio::time::timeout(Duration::from_millis(100), dispatcher.next_event()).await;
        assert!(idle.is_err());

        items.lock().push(item(3));
        bus.notify("s");
        let change = next(&mut dispatcher).await;
        assert_eq!(change.event_type, EventType::Change);
        assert_eq!(change.value, Some(serde_json::json!({ "rev": 3 })));
        let bookmark = next(&mut dispatcher).await;
        assert_eq!(bookmark.event_type, EventType::Bookmark);
        assert_eq!(bookmark.marker_revision(), Some(Revision::new(3)));
    }

    #[tokio::test]
    async fn wake_without_changes_reparks_silently() {
        let bus = MemSignalBus::new();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let loader: Arc<dyn Loader> = Arc::new(move |_gt: Revision| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, FetchError>(Vec::new()) }
        });
        let watch = KindWatch::new(
            "device",
            Revision::new(7),
            true,
            WatchSource::Direct(loader),
            bus.subscribe("s"),
        );
        let mut dispatcher =
            WatchDispatcher::new(vec![watch], CancellationToken::new(), Duration::from_secs(30));

        bus.notify("s");
        bus.notify("s");
        let idle = tokio::time::timeout(Duration::from_millis(200), dispatcher.next_event()).await;
        assert!(idle.is_err());
        // One fetch at open, one for the coalesced wake.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wake_only_refetches_signaled_kind() {
        let bus = MemSignalBus::new();
        let device_hits = Arc::new(AtomicU32::new(0));
        let counter = device_hits.clone();
        let devices: Arc<dyn Loader> = Arc::new(move |_gt: Revision| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, FetchError>(Vec::new()) }
        });
        let groups = Arc::new(Mutex::new(Vec::new()));

        let mut dispatcher = WatchDispatcher::new(
            vec![
                KindWatch::new(
                    "device",
                    Revision::zero(),
                    false,
                    WatchSource::Direct(devices),
                    bus.subscribe("devices"),
                ),
                KindWatch::new(
                    "security-group",
                    Revision::zero(),
                    false,
                    WatchSource::Direct(shared_loader(groups.clone())),
                    bus.subscribe("groups"),
                ),
            ],
            CancellationToken::new(),
            Duration::from_secs(30),
        );

        let first = next(&mut dispatcher).await;
        let second = next(&mut dispatcher).await;
        assert_eq!(first.event_type, EventType::Tail);
        assert_eq!(second.event_type, EventType::Tail);
        assert_ne!(first.kind, second.kind);

        // Both kinds parked on their tail markers without fetching again.
        let idle = tokio::time::timeout(Duration::from_millis(100), dispatcher.next_event()).await;
        assert!(idle.is_err());
        assert_eq!(device_hits.load(Ordering::SeqCst), 1);

        groups.lock().push(item(1));
        bus.notify("groups");
        let change = next(&mut dispatcher).await;
        assert_eq!(change.kind, "security-group");
        assert_eq!(device_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loader_error_ends_stream() {
        let bus = MemSignalBus::new();
        let loader: Arc<dyn Loader> = Arc::new(|_gt: Revision| async move {
            Err::<ResourceList, _>(FetchError::Loader("database is down".into()))
        });
        let mut dispatcher = WatchDispatcher::new(
            vec![KindWatch::new(
                "device",
                Revision::zero(),
                false,
                WatchSource::Direct(loader),
                bus.subscribe("s"),
            )],
            CancellationToken::new(),
            Duration::from_secs(30),
        );

        let event = next(&mut dispatcher).await;
        assert_eq!(event.event_type, EventType::Error);
        assert_eq!(event.error_message().as_deref(), Some("database is down"));
        assert!(dispatcher.next_event().await.is_none());
        assert_eq!(bus.names_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_closes_and_releases() {
        let bus = MemSignalBus::new();
        let manager = FetchManager::memory();
        let items = Arc::new(Mutex::new(Vec::new()));
        let fetcher = manager.open("org-devices:1", 10, shared_loader(items));
        let cancel = CancellationToken::new();
        let mut dispatcher = WatchDispatcher::new(
            vec![KindWatch::new(
                "device",
                Revision::zero(),
                false,
                WatchSource::Cached(fetcher),
                bus.subscribe("s"),
            )],
            cancel.clone(),
            Duration::from_secs(30),
        );

        assert_eq!(next(&mut dispatcher).await.event_type, EventType::Tail);
        assert_eq!(bus.subscriber_count("s"), 1);
        assert_eq!(manager.open_count("org-devices:1"), 1);

        let waiter = tokio::spawn(async move {
            let event = dispatcher.next_event().await;
            (event, dispatcher)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let (event, mut dispatcher) = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.map(|e| e.event_type), Some(EventType::Close));
        assert!(dispatcher.next_event().await.is_none());
        assert_eq!(bus.names_count(), 0);
        assert_eq!(manager.cache_count(), 0);
    }

    #[tokio::test]
    async fn no_kinds_closes_immediately() {
        let mut dispatcher =
            WatchDispatcher::new(Vec::new(), CancellationToken::new(), Duration::from_secs(30));
        assert_eq!(next(&mut dispatcher).await.event_type, EventType::Close);
        assert!(dispatcher.is_finished());
    }

    #[tokio::test]
    async fn idle_timeout_repolls() {
        let bus = MemSignalBus::new();
        let items = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = WatchDispatcher::new(
            vec![KindWatch::new(
                "device",
                Revision::zero(),
                true,
                WatchSource::Direct(shared_loader(items.clone())),
                bus.subscribe("s"),
            )],
            CancellationToken::new(),
            Duration::from_millis(20),
        );

        let parked = tokio::time::timeout(Duration::from_millis(50), dispatcher.next_event()).await;
        assert!(parked.is_err());

        // A change that was never signaled is not picked up by the timeout:
        // parked kinds only refetch on their signal.
        items.lock().push(item(1));
        let quiet = tokio::time::timeout(Duration::from_millis(200), dispatcher.next_event()).await;
        assert!(quiet.is_err());

        bus.notify("s");
        assert_eq!(next(&mut dispatcher).await.event_type, EventType::Change);
    }
}
