//! Revisioned resources carried by fetches and watch events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Revision;

/// One item of a revision-ordered resource list.
///
/// `value` is the JSON rendering of the resource that will be sent to
/// clients. A set `deleted_at` marks a tombstone: the row was soft deleted
/// and the deletion is observed through the same revision-ordered stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceItem {
    /// Rendered resource.
    pub value: serde_json::Value,
    /// Revision assigned to the last change of this resource.
    pub revision: Revision,
    /// Unix timestamp (milliseconds) of the soft delete, if deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

impl ResourceItem {
    /// Create a live (not deleted) item.
    pub fn new(value: serde_json::Value, revision: Revision) -> Self {
        Self {
            value,
            revision,
            deleted_at: None,
        }
    }

    /// Create a tombstone item.
    pub fn tombstone(value: serde_json::Value, revision: Revision, deleted_at: i64) -> Self {
        Self {
            value,
            revision,
            deleted_at: Some(deleted_at),
        }
    }

    /// Whether this item marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A page of items ordered by revision ascending.
pub type ResourceList = Vec<ResourceItem>;

/// A control-plane resource as stored by the API server.
///
/// Devices, security groups and device metadata all share this shape; the
/// `kind` discriminates them and `body` holds the kind-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource identifier.
    pub id: Uuid,
    /// Resource kind (`device`, `security-group`, `device-metadata`).
    pub kind: String,
    /// Owning organization.
    pub organization_id: Uuid,
    /// Human readable name; metadata keys use it for prefix filtering.
    pub name: String,
    /// Kind specific body.
    #[serde(default)]
    pub body: serde_json::Value,
    /// Revision of the last change.
    pub revision: Revision,
    /// Unix timestamp (milliseconds) of the soft delete, if deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

impl Resource {
    /// Convert into the item form used by fetches.
    pub fn into_item(self) -> Result<ResourceItem, serde_json::Error> {
        let revision = self.revision;
        let deleted_at = self.deleted_at;
        let value = serde_json::to_value(&self)?;
        Ok(ResourceItem {
            value,
            revision,
            deleted_at,
        })
    }
}
