//! Resource list, watch and mutation endpoints.

use super::{check_global, check_watch, parse_organization, record_error, HttpError};
use crate::server::{ListWatch, SyncServer};
use crate::storage::ResourceQuery;
use crate::watch::{watch_response, ResourceKind};
use axum::extract::{Path, Query};
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use sync_types::{ApiError, Resource, Revision};
use uuid::Uuid;

const TOTAL_COUNT: HeaderName = HeaderName::from_static("x-total-count");

/// Query parameters of a list request.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Stream changes instead of returning the current list.
    #[serde(default)]
    pub watch: bool,
    /// Last revision the client has seen.
    #[serde(default)]
    pub gt_revision: Option<u64>,
    /// Whether the client already holds the complete list.
    #[serde(default)]
    pub at_tail: bool,
    /// Comma separated name prefixes (metadata only).
    #[serde(default)]
    pub prefix: Option<String>,
}

impl ListParams {
    fn prefixes(&self) -> Vec<String> {
        self.prefix
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Body of a create or update request.
#[derive(Debug, Deserialize)]
pub struct PutBody {
    /// Resource name.
    pub name: String,
    /// Kind-specific document.
    #[serde(default)]
    pub body: serde_json::Value,
}

fn parse_kind(segment: &str) -> Result<ResourceKind, HttpError> {
    ResourceKind::from_path_segment(segment).ok_or_else(|| {
        HttpError::new(
            StatusCode::NOT_FOUND,
            ApiError::new(format!("unknown resource kind: {segment}")),
        )
    })
}

fn parse_id(raw: &str) -> Result<Uuid, HttpError> {
    Uuid::parse_str(raw).map_err(|_| HttpError::invalid_field("id"))
}

/// `GET /api/organizations/:organization/:kind`
///
/// Lists live resources, or with `watch=true` streams changes to them.
pub async fn list_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Path((organization, kind)): Path<(String, String)>,
    Query(params): Query<ListParams>,
) -> Result<Response, HttpError> {
    check_global(&server)?;
    let organization = parse_organization(&organization)?;
    let kind = parse_kind(&kind)?;
    let prefixes = match kind {
        ResourceKind::DeviceMetadata => params.prefixes(),
        _ => Vec::new(),
    };

    if params.watch {
        check_watch(&server, &organization)?;
        let dispatcher = server.open_list_watch(
            organization,
            kind,
            ListWatch {
                gt_revision: Revision::new(params.gt_revision.unwrap_or(0)),
                at_tail: params.at_tail,
                prefixes,
            },
        );
        return Ok(watch_response(
            dispatcher,
            server.config().watch.channel_capacity,
            Arc::clone(server.metrics()),
        ));
    }

    let query = ResourceQuery::new(kind.name(), organization).with_prefixes(prefixes);
    let resources = server
        .storage()
        .list_resources(&query)
        .await
        .map_err(|e| record_error(&server, e.into()))?;

    Ok((
        [(TOTAL_COUNT, resources.len().to_string())],
        Json(resources),
    )
        .into_response())
}

/// `PUT /api/organizations/:organization/:kind/:id`
pub async fn put_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Path((organization, kind, id)): Path<(String, String, String)>,
    Json(request): Json<PutBody>,
) -> Result<Json<Resource>, HttpError> {
    check_global(&server)?;
    let organization = parse_organization(&organization)?;
    let kind = parse_kind(&kind)?;
    let id = parse_id(&id)?;

    let resource = server
        .put_resource(kind, organization, id, request.name, request.body)
        .await
        .map_err(|e| record_error(&server, e.into()))?;
    Ok(Json(resource))
}

/// `DELETE /api/organizations/:organization/:kind/:id`
///
/// Returns the tombstone.
pub async fn delete_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Path((organization, kind, id)): Path<(String, String, String)>,
) -> Result<Json<Resource>, HttpError> {
    check_global(&server)?;
    let organization = parse_organization(&organization)?;
    let kind = parse_kind(&kind)?;
    let id = parse_id(&id)?;

    let resource = server
        .delete_resource(kind, organization, id)
        .await
        .map_err(|e| record_error(&server, e.into()))?;
    Ok(Json(resource))
}
