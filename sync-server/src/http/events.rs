//! Multi-kind watch endpoint.

use super::{check_global, check_watch, parse_organization, record_error, HttpError};
use crate::server::SyncServer;
use crate::watch::watch_response;
use axum::body::Bytes;
use axum::extract::Path;
use axum::response::Response;
use axum::Extension;
use std::sync::Arc;
use sync_types::{ApiError, Watch};

/// `POST /api/organizations/:organization/events`
///
/// The body is a JSON array of watches. The response streams one event per
/// line until the client disconnects or the stream ends with `error` or
/// `close`.
pub async fn watch_events_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Path(organization): Path<String>,
    body: Bytes,
) -> Result<Response, HttpError> {
    check_global(&server)?;
    let organization = parse_organization(&organization)?;

    let watches: Vec<Watch> = serde_json::from_slice(&body).map_err(|e| {
        tracing::debug!(error = %e, "malformed watch request");
        HttpError::from(ApiError::new(format!("invalid request body: {e}")))
    })?;

    check_watch(&server, &organization)?;

    let dispatcher = server
        .open_watches(organization, &watches)
        .map_err(|e| record_error(&server, e.into()))?;

    Ok(watch_response(
        dispatcher,
        server.config().watch.channel_capacity,
        Arc::clone(server.metrics()),
    ))
}
