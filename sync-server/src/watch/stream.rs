//! Watch stream responses.
//!
//! A pump task drives the dispatcher and hands each encoded event to the
//! response body through a bounded channel. The body yields one chunk per
//! event, so every event is flushed as soon as it is produced.

use axum::body::{Body, Bytes};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use sync_types::WATCH_CONTENT_TYPE;
use tokio::sync::mpsc;

use super::WatchDispatcher;
use crate::server::ServerMetrics;

/// Stream `dispatcher`'s events as a newline-delimited JSON response.
///
/// The stream ends after the first `error` or `close` event. A client that
/// goes away stops the dispatcher and releases its subscriptions.
pub fn watch_response(
    dispatcher: WatchDispatcher,
    capacity: usize,
    metrics: Arc<ServerMetrics>,
) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(capacity.max(1));
    tokio::spawn(pump(dispatcher, tx, metrics));

    let events = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, Infallible>(line), rx))
    });

    (
        [(CONTENT_TYPE, WATCH_CONTENT_TYPE), (CACHE_CONTROL, "no-cache")],
        Body::from_stream(events),
    )
        .into_response()
}

async fn pump(
    mut dispatcher: WatchDispatcher,
    tx: mpsc::Sender<Bytes>,
    metrics: Arc<ServerMetrics>,
) {
    metrics.watch_streams_active.fetch_add(1, Ordering::Relaxed);
    metrics.watch_streams_total.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(kinds = dispatcher.kind_count(), "watch stream opened");

    loop {
        let next = tokio::select! {
            _ = tx.closed() => None,
            event = dispatcher.next_event() => event,
        };
        let Some(event) = next else {
            break;
        };

        let terminal = event.event_type.is_terminal();
        let line = match event.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode watch event");
                metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                break;
            }
        };
        if tx.send(Bytes::from(line)).await.is_err() {
            break;
        }
        metrics.events_sent.fetch_add(1, Ordering::Relaxed);
        if terminal {
            break;
        }
    }

    dispatcher.close();
    metrics.watch_streams_active.fetch_sub(1, Ordering::Relaxed);
    tracing::debug!("watch stream closed");
}
