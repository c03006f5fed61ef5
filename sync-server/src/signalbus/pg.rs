//! Clustered signal bus over a Postgres notify channel.
//!
//! Every replica publishes its notifies with `pg_notify(channel, name)` and
//! keeps one dedicated `LISTEN` connection. Inbound payloads are replayed on
//! the local bus, so a replica sees its own notifies only through the echo.
//!
//! The listen connection is driven by [`ListenerState`]: lost connections
//! are retried with backoff, idle connections are pinged, and a recovered
//! connection wakes every local subscription because notifications sent
//! during the outage are gone.
//!
//! Outbound notifies are level-triggered, so they are queued as a set of
//! pending names: a name published again before its first publish went out
//! is sent once, and a pending `*` absorbs every other name. When a publish
//! fails the rest of the batch is dropped; the outage it reflects also
//! drops the listen connections, and their reconnect wakes everything.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{BackoffPolicy, ListenerAction, ListenerEvent, ListenerState};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{MemSignalBus, SignalBus, Subscription, NOTIFY_ALL};
use crate::config::SignalBusConfig;
use crate::error::SignalBusError;

/// Sends one notification to every replica.
#[async_trait]
pub trait NotifyPublisher: Send + Sync + 'static {
    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), SignalBusError>;
}

/// The receiving end of the notify channel.
#[async_trait]
pub trait NotificationSource: Send + 'static {
    /// Open the listen connection and subscribe.
    async fn connect(&mut self) -> Result<(), SignalBusError>;

    /// Wait for the next payload. Cancel safe.
    ///
    /// Returns [`SignalBusError::ConnectionClosed`] when the connection drops.
    async fn recv(&mut self) -> Result<String, SignalBusError>;

    /// Keepalive query on the listen connection.
    async fn ping(&mut self) -> Result<(), SignalBusError>;

    /// Drop the listen connection.
    fn close(&mut self);
}

/// Publishes through `SELECT pg_notify($1, $2)`.
#[derive(Debug, Clone)]
pub struct PgPublisher {
    pool: PgPool,
}

impl PgPublisher {
    /// Publish through connections from `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotifyPublisher for PgPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), SignalBusError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Listens with a dedicated [`PgListener`].
pub struct PgNotificationSource {
    pool: PgPool,
    channel: String,
    listener: Option<PgListener>,
}

impl std::fmt::Debug for PgNotificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNotificationSource")
            .field("channel", &self.channel)
            .field("connected", &self.listener.is_some())
            .finish()
    }
}

impl PgNotificationSource {
    /// Listen on `channel` using connection settings from `pool`.
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
            listener: None,
        }
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn connect(&mut self) -> Result<(), SignalBusError> {
        self.listener = None;
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        self.listener = Some(listener);
        Ok(())
    }

    async fn recv(&mut self) -> Result<String, SignalBusError> {
        let listener = self
            .listener
            .as_mut()
            .ok_or(SignalBusError::ConnectionClosed)?;
        // try_recv reports a lost connection as Ok(None) instead of
        // silently reconnecting, so the state machine sees the loss.
        match listener.try_recv().await? {
            Some(notification) => Ok(notification.payload().to_string()),
            None => Err(SignalBusError::ConnectionClosed),
        }
    }

    async fn ping(&mut self) -> Result<(), SignalBusError> {
        let listener = self
            .listener
            .as_mut()
            .ok_or(SignalBusError::ConnectionClosed)?;
        sqlx::query("SELECT 1").execute(listener).await?;
        Ok(())
    }

    fn close(&mut self) {
        self.listener = None;
    }
}

/// Listener tuning.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Notify channel name.
    pub channel: String,
    /// Reconnect backoff.
    pub backoff: BackoffPolicy,
    /// Ping after this long without a notification.
    pub idle_ping: Duration,
    /// A ping still running after this long counts as failed.
    pub ping_timeout: Duration,
}

impl From<&SignalBusConfig> for ListenerOptions {
    fn from(config: &SignalBusConfig) -> Self {
        Self {
            channel: config.channel.clone(),
            backoff: config.backoff(),
            idle_ping: config.idle_ping(),
            ping_timeout: config.ping_timeout(),
        }
    }
}

/// Names waiting for the publisher task, in first-notify order.
#[derive(Debug, Default)]
struct PublishQueue {
    pending: parking_lot::Mutex<PendingNames>,
    ready: Notify,
}

#[derive(Debug, Default)]
struct PendingNames {
    order: VecDeque<String>,
    names: HashSet<String>,
}

impl PublishQueue {
    fn push(&self, name: &str) {
        {
            let mut pending = self.pending.lock();
            if pending.names.contains(NOTIFY_ALL) || pending.names.contains(name) {
                return;
            }
            if name == NOTIFY_ALL {
                pending.order.clear();
                pending.names.clear();
            }
            pending.order.push_back(name.to_string());
            pending.names.insert(name.to_string());
        }
        self.ready.notify_one();
    }

    fn take(&self) -> VecDeque<String> {
        let mut pending = self.pending.lock();
        pending.names.clear();
        std::mem::take(&mut pending.order)
    }

    fn len(&self) -> usize {
        self.pending.lock().order.len()
    }
}

/// Signal bus shared by every replica through a database notify channel.
pub struct PgSignalBus {
    local: MemSignalBus,
    queue: Arc<PublishQueue>,
    cancel: CancellationToken,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PgSignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSignalBus")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl PgSignalBus {
    /// Start a clustered bus against `database_url`.
    ///
    /// The pool is lazy: an unreachable database only delays cross-replica
    /// delivery, the listener keeps retrying in the background.
    pub fn connect(
        database_url: &str,
        config: &SignalBusConfig,
        cancel: CancellationToken,
    ) -> Result<Self, SignalBusError> {
        let pool = PgPool::connect_lazy(database_url)?;
        let source = PgNotificationSource::new(pool.clone(), config.channel.clone());
        Ok(Self::start(
            MemSignalBus::new(),
            Arc::new(PgPublisher::new(pool)),
            source,
            ListenerOptions::from(config),
            cancel,
        ))
    }

    /// Start a clustered bus from its parts.
    pub fn start<S: NotificationSource>(
        local: MemSignalBus,
        publisher: Arc<dyn NotifyPublisher>,
        source: S,
        options: ListenerOptions,
        cancel: CancellationToken,
    ) -> Self {
        let queue = Arc::new(PublishQueue::default());
        tokio::spawn(run_publisher(
            publisher,
            options.channel.clone(),
            Arc::clone(&queue),
            cancel.clone(),
        ));
        let listener = tokio::spawn(run_listener(
            source,
            local.clone(),
            options,
            cancel.clone(),
        ));
        Self {
            local,
            queue,
            cancel,
            listener: parking_lot::Mutex::new(Some(listener)),
        }
    }

    /// The local bus that inbound notifications are replayed on.
    pub fn local(&self) -> &MemSignalBus {
        &self.local
    }

    /// Stop the listener and wait for it to release its connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Notifies queued but not yet handed to the publisher.
    pub fn pending_publishes(&self) -> usize {
        self.queue.len()
    }

    fn publish(&self, payload: &str) {
        if self.cancel.is_cancelled() {
            tracing::debug!(signal = payload, "signal bus stopped; dropping notify");
            return;
        }
        self.queue.push(payload);
    }
}

impl SignalBus for PgSignalBus {
    fn notify(&self, name: &str) {
        self.publish(name);
    }

    fn notify_all(&self) {
        self.publish(NOTIFY_ALL);
    }

    fn subscribe(&self, name: &str) -> Subscription {
        self.local.subscribe(name)
    }
}

impl Drop for PgSignalBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_publisher(
    publisher: Arc<dyn NotifyPublisher>,
    channel: String,
    queue: Arc<PublishQueue>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = queue.ready.notified() => {}
        }
        let mut batch = queue.take();
        while let Some(payload) = batch.pop_front() {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = publisher.publish(&channel, &payload) => result,
            };
            if let Err(e) = result {
                tracing::warn!(
                    signal = %payload,
                    dropped = batch.len(),
                    error = %e,
                    "failed to publish notify"
                );
                break;
            }
        }
    }
}

fn deliver(local: &MemSignalBus, payload: &str) {
    if payload == NOTIFY_ALL {
        local.notify_all();
    } else {
        local.notify(payload);
    }
}

async fn run_listener<S: NotificationSource>(
    mut source: S,
    local: MemSignalBus,
    options: ListenerOptions,
    cancel: CancellationToken,
) {
    let mut state = ListenerState::new();
    let mut pending = std::collections::VecDeque::from([ListenerEvent::StartRequested]);

    loop {
        let event = match pending.pop_front() {
            Some(event) => event,
            None if cancel.is_cancelled() => ListenerEvent::StopRequested,
            None if state.is_listening() => {
                tokio::select! {
                    _ = cancel.cancelled() => ListenerEvent::StopRequested,
                    received = tokio::time::timeout(options.idle_ping, source.recv()) => {
                        match received {
                            Err(_) => ListenerEvent::IdleTimeout,
                            Ok(Ok(payload)) => {
                                tracing::trace!(signal = %payload, "notification received");
                                deliver(&local, &payload);
                                continue;
                            }
                            Ok(Err(e)) => ListenerEvent::ConnectionLost { error: e.to_string() },
                        }
                    }
                }
            }
            // Not listening and nothing scheduled: only shutdown is left.
            None => {
                cancel.cancelled().await;
                ListenerEvent::StopRequested
            }
        };

        match &event {
            ListenerEvent::ConnectFailed { error }
            | ListenerEvent::ConnectionLost { error }
            | ListenerEvent::PingFailed { error } => {
                tracing::warn!(
                    channel = %options.channel,
                    error = %error,
                    "signal bus listener failure"
                );
            }
            _ => {}
        }

        let stopping = event == ListenerEvent::StopRequested;
        let (next, actions) = state.on_event(event, &options.backoff);
        state = next;

        for action in actions {
            match action {
                ListenerAction::Connect => {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => {
                            pending.push_back(ListenerEvent::StopRequested);
                            continue;
                        }
                        result = source.connect() => result,
                    };
                    match result {
                        Ok(()) => {
                            tracing::info!(channel = %options.channel, "signal bus listening");
                            pending.push_back(ListenerEvent::ConnectSucceeded);
                        }
                        Err(e) => pending.push_back(ListenerEvent::ConnectFailed {
                            error: e.to_string(),
                        }),
                    }
                }
                ListenerAction::Ping => {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => {
                            pending.push_back(ListenerEvent::StopRequested);
                            continue;
                        }
                        result = tokio::time::timeout(options.ping_timeout, source.ping()) => {
                            result
                        }
                    };
                    let error = match result {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e.to_string()),
                        Err(_) => Some(format!("ping timed out after {:?}", options.ping_timeout)),
                    };
                    if let Some(error) = error {
                        pending.push_back(ListenerEvent::PingFailed { error });
                    }
                }
                ListenerAction::NotifyAll => {
                    tracing::info!("signal bus reconnected; waking all subscriptions");
                    local.notify_all();
                }
                ListenerAction::StartReconnectTimer { delay } => {
                    tracing::debug!(?delay, "signal bus reconnect scheduled");
                    tokio::select! {
                        _ = cancel.cancelled() => pending.push_back(ListenerEvent::StopRequested),
                        _ = tokio::time::sleep(delay) => {
                            pending.push_back(ListenerEvent::ReconnectTimer)
                        }
                    }
                }
                ListenerAction::Close => source.close(),
            }
        }

        if stopping {
            tracing::debug!("signal bus listener stopped");
            return;
        }
    }
}
