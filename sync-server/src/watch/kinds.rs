//! Watchable resource kinds and their loaders.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use sync_types::{ResourceList, Revision};
use uuid::Uuid;

use crate::error::FetchError;
use crate::fetchmgr::Loader;
use crate::server::ServerMetrics;
use crate::signalbus::{devices_signal, metadata_signal, security_groups_signal};
use crate::storage::{ResourceQuery, ResourceStorage};

/// A resource kind that can be watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Devices, followed through the fetch manager.
    Device,
    /// Security groups.
    SecurityGroup,
    /// Device metadata, filterable by key prefix.
    DeviceMetadata,
}

impl ResourceKind {
    /// Every watchable kind.
    pub const ALL: [ResourceKind; 3] = [Self::Device, Self::SecurityGroup, Self::DeviceMetadata];

    /// Parse the kind name used in watch requests.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Parse the kind's URL path segment.
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.path_segment() == segment)
    }

    /// Kind name used in watch requests and events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::SecurityGroup => "security-group",
            Self::DeviceMetadata => "device-metadata",
        }
    }

    /// URL path segment under `/api/organizations/:organization/`.
    pub fn path_segment(&self) -> &'static str {
        match self {
            Self::Device => "devices",
            Self::SecurityGroup => "security-groups",
            Self::DeviceMetadata => "metadata",
        }
    }

    /// Signal notified after a change to this kind in `organization`.
    pub fn signal(&self, organization: &Uuid) -> String {
        match self {
            Self::Device => devices_signal(organization),
            Self::SecurityGroup => security_groups_signal(organization),
            Self::DeviceMetadata => metadata_signal(organization),
        }
    }

    /// Fetch manager key shared by every watcher of this kind, if the kind
    /// is followed through the fetch manager.
    pub fn cache_key(&self, organization: &Uuid) -> Option<String> {
        match self {
            Self::Device => Some(format!("org-devices:{organization}")),
            Self::SecurityGroup | Self::DeviceMetadata => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Loader paging through `query`'s changes, tombstones included.
pub fn storage_loader(
    storage: Arc<dyn ResourceStorage>,
    query: ResourceQuery,
    page_size: u32,
    metrics: Arc<ServerMetrics>,
) -> Arc<dyn Loader> {
    Arc::new(move |gt: Revision| {
        let storage = Arc::clone(&storage);
        let query = query.clone().changes_after(gt, page_size);
        metrics.loader_calls.fetch_add(1, Ordering::Relaxed);
        async move {
            let rows = storage.list_resources(&query).await?;
            rows.into_iter()
                .map(|row| {
                    row.into_item()
                        .map_err(|e| FetchError::Loader(e.to_string()))
                })
                .collect::<Result<ResourceList, FetchError>>()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PutResource, SqliteStorage};

    #[test]
    fn names_and_segments_round_trip() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::from_name(kind.name()), Some(kind));
            assert_eq!(ResourceKind::from_path_segment(kind.path_segment()), Some(kind));
        }
        assert_eq!(ResourceKind::from_name("devices"), None);
        assert_eq!(ResourceKind::from_path_segment("device"), None);
    }

    #[test]
    fn only_devices_use_the_fetch_manager() {
        let org = Uuid::nil();
        assert_eq!(
            ResourceKind::Device.cache_key(&org).as_deref(),
            Some("org-devices:00000000-0000-0000-0000-000000000000")
        );
        assert!(ResourceKind::SecurityGroup.cache_key(&org).is_none());
        assert!(ResourceKind::DeviceMetadata.cache_key(&org).is_none());
    }

    #[tokio::test]
    async fn loader_pages_changes_and_counts_calls() {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let org = Uuid::new_v4();
        for i in 0..5 {
            storage
                .put_resource(PutResource {
                    id: Uuid::new_v4(),
                    kind: "device".into(),
                    organization_id: org,
                    name: format!("d{i}"),
                    body: serde_json::json!({}),
                })
                .await
                .unwrap();
        }

        let metrics = Arc::new(ServerMetrics::default());
        let loader = storage_loader(
            storage,
            ResourceQuery::new("device", org),
            2,
            metrics.clone(),
        );

        let page = loader.load(Revision::zero()).await.unwrap();
        let revisions: Vec<u64> = page.iter().map(|i| i.revision.value()).collect();
        assert_eq!(revisions, vec![1, 2]);

        let page = loader.load(Revision::new(4)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].value["name"], "d4");

        assert!(loader.load(Revision::new(5)).await.unwrap().is_empty());
        assert_eq!(metrics.loader_calls.load(Ordering::Relaxed), 3);
    }
}
