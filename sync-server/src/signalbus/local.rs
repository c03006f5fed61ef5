//! In-process signal bus.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use super::SignalBus;

/// Wake slot of one subscription.
struct Slot {
    tx: mpsc::Sender<()>,
    /// Latest notify, written before the wake is sent.
    notified_at: Mutex<Option<Instant>>,
}

type Waker = (u64, Arc<Slot>);

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    names: RwLock<HashMap<String, Vec<Waker>>>,
}

impl Registry {
    fn remove(&self, name: &str, id: u64) {
        let mut names = self.names.write();
        if let Some(wakers) = names.get_mut(name) {
            wakers.retain(|(waker_id, _)| *waker_id != id);
            if wakers.is_empty() {
                names.remove(name);
            }
        }
    }
}

/// In-process signal bus.
///
/// Cheap to clone; clones share one registry.
#[derive(Clone, Default)]
pub struct MemSignalBus {
    registry: Arc<Registry>,
}

impl std::fmt::Debug for MemSignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemSignalBus")
            .field("names", &self.names_count())
            .finish()
    }
}

impl MemSignalBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of names with at least one subscription.
    pub fn names_count(&self) -> usize {
        self.registry.names.read().len()
    }

    /// Number of live subscriptions under `name`.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.registry
            .names
            .read()
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn wake(slots: Vec<Arc<Slot>>) {
        let now = Instant::now();
        for slot in slots {
            *slot.notified_at.lock() = Some(now);
            // Full slot: the subscriber has a pending wake already.
            let _ = slot.tx.try_send(());
        }
    }
}

impl SignalBus for MemSignalBus {
    fn notify(&self, name: &str) {
        let wakers: Vec<_> = {
            let names = self.registry.names.read();
            match names.get(name) {
                Some(wakers) => wakers.iter().map(|(_, slot)| Arc::clone(slot)).collect(),
                None => return,
            }
        };
        tracing::trace!(signal = name, subscribers = wakers.len(), "notify");
        Self::wake(wakers);
    }

    fn notify_all(&self) {
        let wakers: Vec<_> = {
            let names = self.registry.names.read();
            names
                .values()
                .flat_map(|wakers| wakers.iter().map(|(_, slot)| Arc::clone(slot)))
                .collect()
        };
        tracing::debug!(subscribers = wakers.len(), "notify all");
        Self::wake(wakers);
    }

    fn subscribe(&self, name: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(1);
        let slot = Arc::new(Slot {
            tx,
            notified_at: Mutex::new(None),
        });
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .names
            .write()
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::clone(&slot)));
        Subscription {
            id,
            name: name.to_string(),
            registry: Arc::clone(&self.registry),
            slot,
            rx,
            closed: false,
        }
    }
}

/// A lease on one signal name.
///
/// Holds a single wake slot: notifies that arrive while the slot is full
/// are absorbed.
pub struct Subscription {
    id: u64,
    name: String,
    registry: Arc<Registry>,
    slot: Arc<Slot>,
    rx: mpsc::Receiver<()>,
    closed: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Subscription {
    /// The subscribed signal name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until the subscription is signaled, consuming the wake.
    ///
    /// Cancel safe. Never completes once the subscription is closed.
    pub async fn signaled(&mut self) {
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }

    /// Consume a pending wake without waiting.
    pub fn is_signaled(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// When the latest notify for this subscription was raised.
    ///
    /// Read after consuming a wake, this is never earlier than the notify
    /// behind that wake.
    pub fn notified_at(&self) -> Option<Instant> {
        *self.slot.notified_at.lock()
    }

    /// Release the subscription. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.registry.remove(&self.name, self.id);
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn notify_wakes_subscriber() {
        let bus = MemSignalBus::new();
        let mut sub = bus.subscribe("/devices/org=1");

        bus.notify("/devices/org=1");
        tokio::time::timeout(Duration::from_secs(1), sub.signaled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn notifies_coalesce_into_one_wake() {
        let bus = MemSignalBus::new();
        let mut sub = bus.subscribe("a");

        for _ in 0..5 {
            bus.notify("a");
        }
        assert!(sub.is_signaled());
        assert!(!sub.is_signaled());
    }

    #[tokio::test]
    async fn absorbed_notify_still_moves_the_timestamp() {
        let bus = MemSignalBus::new();
        let mut sub = bus.subscribe("a");
        assert!(sub.notified_at().is_none());

        bus.notify("a");
        let first = sub.notified_at().unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        bus.notify("a");

        assert!(sub.is_signaled());
        assert!(sub.notified_at().unwrap() > first);
    }

    #[tokio::test]
    async fn notify_only_reaches_matching_name() {
        let bus = MemSignalBus::new();
        let mut a = bus.subscribe("a");
        let mut b = bus.subscribe("b");

        bus.notify("a");
        assert!(a.is_signaled());
        assert!(!b.is_signaled());
    }

    #[tokio::test]
    async fn notify_without_subscribers_is_noop() {
        let bus = MemSignalBus::new();
        bus.notify("nobody");
        assert_eq!(bus.names_count(), 0);
    }

    #[tokio::test]
    async fn notify_all_wakes_every_name() {
        let bus = MemSignalBus::new();
        let mut a = bus.subscribe("a");
        let mut b1 = bus.subscribe("b");
        let mut b2 = bus.subscribe("b");

        bus.notify_all();
        assert!(a.is_signaled());
        assert!(b1.is_signaled());
        assert!(b2.is_signaled());
    }

    #[tokio::test]
    async fn registry_entry_removed_after_last_close() {
        let bus = MemSignalBus::new();
        let mut first = bus.subscribe("a");
        let mut second = bus.subscribe("a");
        assert_eq!(bus.subscriber_count("a"), 2);

        first.close();
        assert_eq!(bus.subscriber_count("a"), 1);
        assert_eq!(bus.names_count(), 1);

        second.close();
        second.close();
        assert_eq!(bus.names_count(), 0);
    }

    #[tokio::test]
    async fn drop_releases_subscription() {
        let bus = MemSignalBus::new();
        {
            let _sub = bus.subscribe("a");
            assert_eq!(bus.names_count(), 1);
        }
        assert_eq!(bus.names_count(), 0);
    }

    #[tokio::test]
    async fn closed_subscription_never_signals() {
        let bus = MemSignalBus::new();
        let mut sub = bus.subscribe("a");
        sub.close();
        bus.notify("a");

        let waited = tokio::time::timeout(Duration::from_millis(20), sub.signaled()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn wake_survives_until_drained() {
        let bus = MemSignalBus::new();
        let mut sub = bus.subscribe("a");
        bus.notify("a");

        tokio::time::sleep(Duration::from_millis(5)).await;
        tokio::time::timeout(Duration::from_secs(1), sub.signaled())
            .await
            .unwrap();
    }
}
