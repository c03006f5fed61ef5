//! SQLite storage backend for the sync server.

use super::{PutResource, ResourceQuery, ResourceStorage};
use crate::error::StorageError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use sync_types::{Resource, Revision};
use uuid::Uuid;

const RESOURCE_COLUMNS: &str = "id, kind, organization_id, name, body, revision, deleted_at";

/// SQLite-based resource storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage from a database path.
    ///
    /// Creates the database file if it doesn't exist.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        let url = path.to_str().ok_or_else(|| StorageError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kind_revisions (
                kind TEXT PRIMARY KEY,
                next_revision INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                name TEXT NOT NULL,
                body TEXT NOT NULL,
                revision INTEGER NOT NULL,
                deleted_at INTEGER,
                PRIMARY KEY (kind, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_resources_org_revision ON resources(kind, organization_id, revision)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Atomically take the next revision of `kind`.
    ///
    /// Must be the first statement of the write transaction: the row lock
    /// it takes orders commits by revision, so a reader never sees
    /// revision `n + 1` before `n`.
    async fn next_revision(
        tx: &mut Transaction<'_, Sqlite>,
        kind: &str,
    ) -> Result<Revision, StorageError> {
        let revision: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO kind_revisions (kind, next_revision)
            VALUES (?1, 2)
            ON CONFLICT(kind) DO UPDATE SET next_revision = next_revision + 1
            RETURNING next_revision - 1
            "#,
        )
        .bind(kind)
        .fetch_one(&mut **tx)
        .await?;

        Ok(Revision::new(revision as u64))
    }

    async fn fetch_row(
        tx: &mut Transaction<'_, Sqlite>,
        kind: &str,
        id: &Uuid,
    ) -> Result<Option<ResourceRow>, StorageError> {
        let row = sqlx::query_as::<_, ResourceRow>(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE kind = ?1 AND id = ?2"
        ))
        .bind(kind)
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }

    fn current_timestamp_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ResourceStorage for SqliteStorage {
    async fn put_resource(&self, req: PutResource) -> Result<Resource, StorageError> {
        let body = serde_json::to_string(&req.body)?;
        let mut tx = self.pool.begin().await?;
        let revision = Self::next_revision(&mut tx, &req.kind).await?;

        if let Some(existing) = Self::fetch_row(&mut tx, &req.kind, &req.id).await? {
            if existing.organization_id != req.organization_id.to_string() {
                return Err(StorageError::NotFound {
                    kind: req.kind,
                    id: req.id.to_string(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO resources (kind, id, organization_id, name, body, revision, deleted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)
            ON CONFLICT(kind, id) DO UPDATE SET
                name = excluded.name,
                body = excluded.body,
                revision = excluded.revision,
                deleted_at = NULL
            "#,
        )
        .bind(req.kind.as_str())
        .bind(req.id.to_string())
        .bind(req.organization_id.to_string())
        .bind(req.name.as_str())
        .bind(body.as_str())
        .bind(revision.value() as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Resource {
            id: req.id,
            kind: req.kind,
            organization_id: req.organization_id,
            name: req.name,
            body: req.body,
            revision,
            deleted_at: None,
        })
    }

    async fn delete_resource(
        &self,
        kind: &str,
        organization_id: &Uuid,
        id: &Uuid,
    ) -> Result<Resource, StorageError> {
        let not_found = || StorageError::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        };

        let mut tx = self.pool.begin().await?;
        let revision = Self::next_revision(&mut tx, kind).await?;

        let row = Self::fetch_row(&mut tx, kind, id)
            .await?
            .filter(|row| row.deleted_at.is_none())
            .filter(|row| row.organization_id == organization_id.to_string())
            .ok_or_else(not_found)?;

        let deleted_at = Self::current_timestamp_millis();
        sqlx::query(
            "UPDATE resources SET revision = ?1, deleted_at = ?2 WHERE kind = ?3 AND id = ?4",
        )
        .bind(revision.value() as i64)
        .bind(deleted_at)
        .bind(kind)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut resource = Resource::try_from(row)?;
        resource.revision = revision;
        resource.deleted_at = Some(deleted_at);
        Ok(resource)
    }

    async fn get_resource(&self, kind: &str, id: &Uuid) -> Result<Option<Resource>, StorageError> {
        let row = sqlx::query_as::<_, ResourceRow>(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE kind = ?1 AND id = ?2"
        ))
        .bind(kind)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Resource::try_from).transpose()
    }

    async fn list_resources(&self, query: &ResourceQuery) -> Result<Vec<Resource>, StorageError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE kind = "));
        builder.push_bind(query.kind.clone());
        builder.push(" AND organization_id = ");
        builder.push_bind(query.organization_id.to_string());

        if !query.gt_revision.is_zero() {
            builder.push(" AND revision > ");
            builder.push_bind(query.gt_revision.value() as i64);
        }
        if !query.include_deleted {
            builder.push(" AND deleted_at IS NULL");
        }
        if !query.name_prefixes.is_empty() {
            builder.push(" AND (");
            for (i, prefix) in query.name_prefixes.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                builder.push("instr(name, ");
                builder.push_bind(prefix.clone());
                builder.push(") = 1");
            }
            builder.push(")");
        }

        builder.push(" ORDER BY revision ASC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows = builder
            .build_query_as::<ResourceRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Resource::try_from).collect()
    }

    async fn max_revision(&self, kind: &str) -> Result<Revision, StorageError> {
        let revision: Option<i64> =
            sqlx::query_scalar("SELECT MAX(revision) FROM resources WHERE kind = ?1")
                .bind(kind)
                .fetch_one(&self.pool)
                .await?;

        Ok(Revision::new(revision.unwrap_or(0) as u64))
    }

    async fn count_resources(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM resources")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

/// Internal row type for SQLite queries.
#[derive(sqlx::FromRow)]
struct ResourceRow {
    id: String,
    kind: String,
    organization_id: String,
    name: String,
    body: String,
    revision: i64,
    deleted_at: Option<i64>,
}

impl TryFrom<ResourceRow> for Resource {
    type Error = StorageError;

    fn try_from(row: ResourceRow) -> Result<Self, Self::Error> {
        Ok(Resource {
            id: Uuid::parse_str(&row.id)
                .map_err(|_| StorageError::Corrupt(format!("invalid id {}", row.id)))?,
            organization_id: Uuid::parse_str(&row.organization_id).map_err(|_| {
                StorageError::Corrupt(format!("invalid organization_id {}", row.organization_id))
            })?,
            kind: row.kind,
            name: row.name,
            body: serde_json::from_str(&row.body)?,
            revision: Revision::new(row.revision as u64),
            deleted_at: row.deleted_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_request(kind: &str, org: Uuid, name: &str) -> PutResource {
        PutResource {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            organization_id: org,
            name: name.to_string(),
            body: serde_json::json!({ "name": name }),
        }
    }

    #[tokio::test]
    async fn put_assigns_revision() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let org = Uuid::new_v4();

        let resource = storage
            .put_resource(make_request("device", org, "laptop"))
            .await
            .unwrap();

        assert_eq!(resource.revision.value(), 1);
        assert!(resource.deleted_at.is_none());
    }

    #[tokio::test]
    async fn revisions_are_monotonic_per_kind() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let org = Uuid::new_v4();

        let d1 = storage
            .put_resource(make_request("device", org, "a"))
            .await
            .unwrap();
        let s1 = storage
            .put_resource(make_request("security-group", org, "default"))
            .await
            .unwrap();
        let d2 = storage
            .put_resource(make_request("device", org, "b"))
            .await
            .unwrap();

        // Each kind has its own revision sequence
        assert_eq!(d1.revision.value(), 1);
        assert_eq!(s1.revision.value(), 1);
        assert_eq!(d2.revision.value(), 2);
        assert_eq!(storage.max_revision("device").await.unwrap().value(), 2);
    }

    #[tokio::test]
    async fn update_bumps_revision() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let org = Uuid::new_v4();
        let mut req = make_request("device", org, "laptop");

        storage.put_resource(req.clone()).await.unwrap();
        req.name = "renamed".into();
        let updated = storage.put_resource(req.clone()).await.unwrap();
        assert_eq!(updated.revision.value(), 2);

        let stored = storage
            .get_resource("device", &req.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.revision.value(), 2);
        assert_eq!(storage.count_resources().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn put_rejects_foreign_organization() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let mut req = make_request("device", Uuid::new_v4(), "laptop");
        storage.put_resource(req.clone()).await.unwrap();

        req.organization_id = Uuid::new_v4();
        let err = storage.put_resource(req).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));

        // The failed write rolled back its revision
        assert_eq!(storage.max_revision("device").await.unwrap().value(), 1);
    }

    #[tokio::test]
    async fn delete_leaves_tombstone() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let org = Uuid::new_v4();
        let req = make_request("device", org, "laptop");
        storage.put_resource(req.clone()).await.unwrap();

        let deleted = storage
            .delete_resource("device", &org, &req.id)
            .await
            .unwrap();
        assert_eq!(deleted.revision.value(), 2);
        assert!(deleted.deleted_at.is_some());

        let stored = storage
            .get_resource("device", &req.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.deleted_at.is_some());

        // Deleting twice is not found
        let err = storage
            .delete_resource("device", &org, &req.id)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let err = storage
            .delete_resource("device", &Uuid::new_v4(), &Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn put_revives_tombstone() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let org = Uuid::new_v4();
        let req = make_request("device", org, "laptop");
        storage.put_resource(req.clone()).await.unwrap();
        storage
            .delete_resource("device", &org, &req.id)
            .await
            .unwrap();

        let revived = storage.put_resource(req.clone()).await.unwrap();
        assert_eq!(revived.revision.value(), 3);
        let stored = storage
            .get_resource("device", &req.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.deleted_at.is_none());
    }

    #[tokio::test]
    async fn list_changes_after_revision() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let org = Uuid::new_v4();

        let mut ids = Vec::new();
        for i in 0..5 {
            let req = make_request("device", org, &format!("device-{}", i));
            ids.push(req.id);
            storage.put_resource(req).await.unwrap();
        }
        storage
            .delete_resource("device", &org, &ids[0])
            .await
            .unwrap();

        let changes = storage
            .list_resources(&ResourceQuery::new("device", org).changes_after(Revision::new(2), 100))
            .await
            .unwrap();
        let revisions: Vec<u64> = changes.iter().map(|r| r.revision.value()).collect();
        assert_eq!(revisions, vec![3, 4, 5, 6]);
        assert!(changes[3].deleted_at.is_some());

        let live = storage
            .list_resources(&ResourceQuery::new("device", org))
            .await
            .unwrap();
        assert_eq!(live.len(), 4);
    }

    #[tokio::test]
    async fn list_respects_limit_and_organization() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let org = Uuid::new_v4();
        let other = Uuid::new_v4();

        for i in 0..10 {
            storage
                .put_resource(make_request("device", org, &format!("d{}", i)))
                .await
                .unwrap();
        }
        storage
            .put_resource(make_request("device", other, "theirs"))
            .await
            .unwrap();

        let page = storage
            .list_resources(&ResourceQuery::new("device", org).changes_after(Revision::zero(), 3))
            .await
            .unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].revision.value(), 1);

        let theirs = storage
            .list_resources(&ResourceQuery::new("device", other))
            .await
            .unwrap();
        assert_eq!(theirs.len(), 1);
        assert_eq!(theirs[0].name, "theirs");
    }

    #[tokio::test]
    async fn list_filters_name_prefixes() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let org = Uuid::new_v4();

        for name in ["tcp:22", "tcp:443", "udp:53", "meta"] {
            storage
                .put_resource(make_request("device-metadata", org, name))
                .await
                .unwrap();
        }

        let tcp = storage
            .list_resources(
                &ResourceQuery::new("device-metadata", org)
                    .with_prefixes(vec!["tcp:".into(), "meta".into()]),
            )
            .await
            .unwrap();
        let names: Vec<&str> = tcp.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["tcp:22", "tcp:443", "meta"]);
    }

    #[tokio::test]
    async fn empty_kind_has_zero_max_revision() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert!(storage.max_revision("device").await.unwrap().is_zero());
        assert_eq!(storage.count_resources().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nexsync.db");
        let org = Uuid::new_v4();
        let req = make_request("device", org, "laptop");

        {
            let storage = SqliteStorage::new(&path).await.unwrap();
            storage.put_resource(req.clone()).await.unwrap();
        }

        let storage = SqliteStorage::new(&path).await.unwrap();
        let stored = storage.get_resource("device", &req.id).await.unwrap();
        assert_eq!(stored.map(|r| r.name), Some("laptop".to_string()));
    }
}
