//! Health check endpoint.

use crate::server::SyncServer;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Number of open watch streams.
    pub watch_streams: u64,
    /// Tail caches held by the fetch manager.
    pub fetch_caches: usize,
    /// Seconds since the server was created.
    pub uptime_seconds: u64,
}

impl HealthStatus {
    /// Snapshot the health of `server`.
    pub fn of(server: &SyncServer) -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            watch_streams: server.metrics().watch_streams_active.load(Ordering::Relaxed),
            fetch_caches: server.fetch_manager().cache_count(),
            uptime_seconds: server.uptime().as_secs(),
        }
    }
}

/// `GET /health`
pub async fn health_handler(Extension(server): Extension<Arc<SyncServer>>) -> Json<HealthStatus> {
    Json(HealthStatus::of(&server))
}
