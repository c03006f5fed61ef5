//! HTTP endpoints for the sync server.
//!
//! Provides health checks, metrics, resource mutations and watch streams.

mod events;
pub mod health;
mod metrics;
mod resources;

use crate::error::StorageError;
use crate::limits::RateLimitError;
use crate::server::SyncServer;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use sync_types::ApiError;
use uuid::Uuid;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(server: Arc<SyncServer>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health_handler))
        .route(
            "/api/organizations/:organization/events",
            post(events::watch_events_handler),
        )
        .route(
            "/api/organizations/:organization/:kind",
            get(resources::list_handler),
        )
        .route(
            "/api/organizations/:organization/:kind/:id",
            put(resources::put_handler).delete(resources::delete_handler),
        );
    if server.config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(server))
}

/// An error response: status code plus an [`ApiError`] JSON body.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    body: ApiError,
}

impl HttpError {
    /// Error with an explicit status.
    pub fn new(status: StatusCode, body: ApiError) -> Self {
        Self { status, body }
    }

    /// 400 naming the offending field.
    pub fn invalid_field(field: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ApiError::invalid_field(field))
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ApiError> for HttpError {
    fn from(body: ApiError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, body)
    }
}

impl From<StorageError> for HttpError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, ApiError::new(err.to_string()))
            }
            other => {
                tracing::error!(error = %other, "storage request failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::new("internal server error"),
                )
            }
        }
    }
}

impl From<RateLimitError> for HttpError {
    fn from(err: RateLimitError) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, ApiError::new(err.to_string()))
    }
}

/// Parse the `:organization` path segment.
fn parse_organization(raw: &str) -> Result<Uuid, HttpError> {
    Uuid::parse_str(raw).map_err(|_| HttpError::invalid_field("organization"))
}

/// Apply the global request limit, counting rejections.
fn check_global(server: &SyncServer) -> Result<(), HttpError> {
    server.rate_limits().check_global().map_err(|e| {
        server.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        HttpError::from(e)
    })
}

/// Apply the per-organization watch open limit, counting rejections.
fn check_watch(server: &SyncServer, organization: &Uuid) -> Result<(), HttpError> {
    server.rate_limits().check_watch(organization).map_err(|e| {
        server.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%organization, "watch rate limited");
        HttpError::from(e)
    })
}

/// Count a failed request.
fn record_error(server: &SyncServer, err: HttpError) -> HttpError {
    if err.status.is_server_error() {
        server.metrics().errors_total.fetch_add(1, Ordering::Relaxed);
    }
    err
}
