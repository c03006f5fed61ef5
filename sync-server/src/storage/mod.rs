//! Storage layer for the sync server.
//!
//! Provides revisioned resource storage. Every insert, update and soft
//! delete assigns the next revision of the resource's kind, so a loader
//! can page through changes with `revision > gt`.

mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use async_trait::async_trait;
use sync_types::{Resource, Revision};
use uuid::Uuid;

/// Request to create or update a resource.
#[derive(Debug, Clone)]
pub struct PutResource {
    /// Resource identifier.
    pub id: Uuid,
    /// Resource kind.
    pub kind: String,
    /// Owning organization.
    pub organization_id: Uuid,
    /// Resource name.
    pub name: String,
    /// Kind specific body.
    pub body: serde_json::Value,
}

/// Filter for [`ResourceStorage::list_resources`].
#[derive(Debug, Clone)]
pub struct ResourceQuery {
    /// Resource kind.
    pub kind: String,
    /// Owning organization.
    pub organization_id: Uuid,
    /// Only rows with a greater revision.
    pub gt_revision: Revision,
    /// Maximum rows returned.
    pub limit: Option<u32>,
    /// Only rows whose name starts with one of these (empty = no filter).
    pub name_prefixes: Vec<String>,
    /// Include soft deleted rows.
    pub include_deleted: bool,
}

impl ResourceQuery {
    /// Live rows of `kind` in `organization_id`.
    pub fn new(kind: impl Into<String>, organization_id: Uuid) -> Self {
        Self {
            kind: kind.into(),
            organization_id,
            gt_revision: Revision::zero(),
            limit: None,
            name_prefixes: Vec::new(),
            include_deleted: false,
        }
    }

    /// Rows changed after `gt`, tombstones included, one page at a time.
    pub fn changes_after(mut self, gt: Revision, limit: u32) -> Self {
        self.gt_revision = gt;
        self.limit = Some(limit);
        self.include_deleted = true;
        self
    }

    /// Restrict to names starting with one of `prefixes`.
    pub fn with_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.name_prefixes = prefixes;
        self
    }
}

/// Trait for resource storage backends.
#[async_trait]
pub trait ResourceStorage: Send + Sync {
    /// Insert or update a resource, assigning it the next revision.
    ///
    /// Updating a soft deleted resource revives it. Fails with `NotFound`
    /// if the id exists in another organization.
    async fn put_resource(&self, req: PutResource) -> Result<Resource, StorageError>;

    /// Soft delete a resource, assigning it the next revision.
    ///
    /// Fails with `NotFound` if the resource is absent or already deleted.
    async fn delete_resource(
        &self,
        kind: &str,
        organization_id: &Uuid,
        id: &Uuid,
    ) -> Result<Resource, StorageError>;

    /// Get a resource by id, tombstones included.
    async fn get_resource(&self, kind: &str, id: &Uuid) -> Result<Option<Resource>, StorageError>;

    /// List resources ordered by revision ascending.
    async fn list_resources(&self, query: &ResourceQuery) -> Result<Vec<Resource>, StorageError>;

    /// Highest revision assigned to `kind`, zero if none.
    async fn max_revision(&self, kind: &str) -> Result<Revision, StorageError>;

    /// Total stored rows, tombstones included.
    async fn count_resources(&self) -> Result<u64, StorageError>;
}
