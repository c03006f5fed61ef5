//! Prometheus metrics endpoint.

use crate::server::SyncServer;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(server): Extension<Arc<SyncServer>>) -> impl IntoResponse {
    let m = server.metrics();

    // Gauges
    let streams_active = m.watch_streams_active.load(Ordering::Relaxed);
    let caches = server.fetch_manager().cache_count();
    let limiter_keys = server.rate_limits().watch_keys_count();

    // Counters
    let streams_total = m.watch_streams_total.load(Ordering::Relaxed);
    let events = m.events_sent.load(Ordering::Relaxed);
    let loads = m.loader_calls.load(Ordering::Relaxed);
    let notifications = m.notifications_published.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    // Storage stats, best effort
    let resources = server.storage().count_resources().await.unwrap_or(0);

    let body = format!(
        r#"# HELP nexsync_info Server information
# TYPE nexsync_info gauge
nexsync_info{{version="{version}"}} 1

# HELP nexsync_watch_streams_active Number of open watch streams
# TYPE nexsync_watch_streams_active gauge
nexsync_watch_streams_active {streams_active}

# HELP nexsync_fetch_caches Number of shared fetch caches in use
# TYPE nexsync_fetch_caches gauge
nexsync_fetch_caches {caches}

# HELP nexsync_rate_limit_keys Number of organizations tracked by the watch limiter
# TYPE nexsync_rate_limit_keys gauge
nexsync_rate_limit_keys {limiter_keys}

# HELP nexsync_resources Number of resource rows, tombstones included
# TYPE nexsync_resources gauge
nexsync_resources {resources}

# HELP nexsync_watch_streams_total Total watch streams opened
# TYPE nexsync_watch_streams_total counter
nexsync_watch_streams_total {streams_total}

# HELP nexsync_events_sent_total Total watch events written
# TYPE nexsync_events_sent_total counter
nexsync_events_sent_total {events}

# HELP nexsync_loader_calls_total Total pages read from storage for watchers
# TYPE nexsync_loader_calls_total counter
nexsync_loader_calls_total {loads}

# HELP nexsync_notifications_total Total signals notified after mutations
# TYPE nexsync_notifications_total counter
nexsync_notifications_total {notifications}

# HELP nexsync_rate_limit_hits_total Total rate limit rejections
# TYPE nexsync_rate_limit_hits_total counter
nexsync_rate_limit_hits_total {rate_limits}

# HELP nexsync_errors_total Total request and stream errors
# TYPE nexsync_errors_total counter
nexsync_errors_total {errors}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
