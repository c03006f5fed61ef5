//! Tail cache shared by every replica through a database table.
//!
//! Rows are keyed by `(cache_key, revision)`. Replicas race to fill the
//! same key; a conflicting insert means another replica already stored the
//! row. Any cache failure sends the fetcher back to direct loading, the
//! cache is never a reason for a fetch to fail.
//!
//! In a fleet the table lives in Postgres, next to the notify channel of
//! the clustered signal bus. A SQLite database works for a single host.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use sync_types::{ResourceItem, ResourceList, Revision};

use super::{Loader, TailCache, TailCursor};
use crate::error::{FetchError, FetchResult, StorageError};

/// Pool on the database holding the cache table.
#[derive(Debug, Clone)]
pub enum CachePool {
    /// Postgres, reachable from every replica.
    Postgres(PgPool),
    /// SQLite, for a single host.
    Sqlite(SqlitePool),
}

/// Run `$body` with `$pool` bound to the concrete pool.
macro_rules! with_pool {
    ($cache_pool:expr, |$pool:ident| $body:expr) => {
        match $cache_pool {
            CachePool::Postgres($pool) => $body,
            CachePool::Sqlite($pool) => $body,
        }
    };
}

/// Connection settings shared by every cache of a manager.
#[derive(Debug, Clone)]
pub struct SharedCacheOptions {
    /// Pool on the shared cache database.
    pub pool: CachePool,
    /// Prefix prepended to every cache key.
    pub key_prefix: String,
    /// Bound on every cache operation.
    pub timeout: Duration,
}

/// Whether `url` names a Postgres database.
pub fn is_postgres_url(url: &str) -> bool {
    url.starts_with("postgres://") || url.starts_with("postgresql://")
}

/// Open the shared cache database at `url` and create its table.
///
/// `postgres://` URLs open a Postgres pool; anything else is taken as a
/// SQLite URL or file path.
pub async fn open_pool(url: &str) -> Result<CachePool, StorageError> {
    let pool = if is_postgres_url(url) {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        CachePool::Postgres(pool)
    } else {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        CachePool::Sqlite(pool)
    };
    migrate(&pool).await?;
    Ok(pool)
}

/// Create the cache table if missing.
pub async fn migrate(pool: &CachePool) -> Result<(), StorageError> {
    const CREATE: &str = r#"
        CREATE TABLE IF NOT EXISTS fetch_cache (
            cache_key TEXT NOT NULL,
            revision BIGINT NOT NULL,
            after_revision BIGINT NOT NULL,
            item TEXT NOT NULL,
            PRIMARY KEY (cache_key, revision)
        )
    "#;
    with_pool!(pool, |pool| sqlx::query(CREATE).execute(pool).await.map(|_| ()))?;
    Ok(())
}

const ROWS_AFTER: &str = r#"
    SELECT revision, after_revision, item
    FROM fetch_cache
    WHERE cache_key = $1 AND revision > $2
    ORDER BY revision ASC
    LIMIT $3
"#;

const HAS_ROWS_AFTER: &str =
    "SELECT EXISTS(SELECT 1 FROM fetch_cache WHERE cache_key = $1 AND revision > $2)";

const INSERT_ROW: &str = r#"
    INSERT INTO fetch_cache (cache_key, revision, after_revision, item)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (cache_key, revision) DO NOTHING
"#;

const TRIM: &str = r#"
    DELETE FROM fetch_cache
    WHERE cache_key = $1 AND revision NOT IN (
        SELECT revision FROM fetch_cache
        WHERE cache_key = $1
        ORDER BY revision DESC
        LIMIT $2
    )
"#;

/// One key's view of the shared cache table.
#[derive(Debug)]
pub struct SharedTailCache {
    options: SharedCacheOptions,
    key: String,
    limit: usize,
    /// Fills completed by this process, including empty ones.
    epoch: AtomicU64,
}

#[derive(sqlx::FromRow)]
struct CacheRow {
    revision: i64,
    after_revision: i64,
    item: String,
}

impl SharedTailCache {
    /// Cache for `key`, holding at most `limit` rows.
    pub fn new(options: SharedCacheOptions, key: &str, limit: usize) -> Self {
        let key = format!("{}{}", options.key_prefix, key);
        Self {
            options,
            key,
            limit: limit.max(1),
            epoch: AtomicU64::new(0),
        }
    }

    async fn bounded<T, F>(&self, op: F) -> FetchResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.options.timeout, op).await {
            Ok(result) => result.map_err(|e| FetchError::Cache(e.to_string())),
            Err(_) => Err(FetchError::Cache("timed out".into())),
        }
    }

    async fn rows_after(&self, gt: Revision) -> FetchResult<Vec<CacheRow>> {
        let key = self.key.as_str();
        let limit = self.limit as i64;
        self.bounded(async move {
            with_pool!(&self.options.pool, |pool| {
                sqlx::query_as::<_, CacheRow>(ROWS_AFTER)
                    .bind(key)
                    .bind(gt.value() as i64)
                    .bind(limit)
                    .fetch_all(pool)
                    .await
            })
        })
        .await
    }

    async fn has_rows_after(&self, gt: Revision) -> FetchResult<bool> {
        let key = self.key.as_str();
        self.bounded(async move {
            with_pool!(&self.options.pool, |pool| {
                sqlx::query_scalar::<_, bool>(HAS_ROWS_AFTER)
                    .bind(key)
                    .bind(gt.value() as i64)
                    .fetch_one(pool)
                    .await
            })
        })
        .await
    }

    async fn store(&self, gt: Revision, items: &[ResourceItem]) -> FetchResult<()> {
        let mut rows = Vec::with_capacity(items.len().min(self.limit));
        let mut after = gt;
        for item in items.iter().take(self.limit) {
            let encoded =
                serde_json::to_string(item).map_err(|e| FetchError::Cache(e.to_string()))?;
            rows.push((item.revision.value() as i64, after.value() as i64, encoded));
            after = item.revision;
        }

        let key = self.key.as_str();
        let limit = self.limit as i64;
        self.bounded(async move {
            with_pool!(&self.options.pool, |pool| {
                let mut tx = pool.begin().await?;
                for (revision, after, encoded) in &rows {
                    sqlx::query(INSERT_ROW)
                        .bind(key)
                        .bind(*revision)
                        .bind(*after)
                        .bind(encoded.as_str())
                        .execute(&mut *tx)
                        .await?;
                }
                sqlx::query(TRIM)
                    .bind(key)
                    .bind(limit)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await
            })
        })
        .await
    }
}

#[async_trait]
impl TailCache for SharedTailCache {
    async fn read(&self, cursor: &mut TailCursor, gt: Revision) -> (ResourceList, u64) {
        let mark = self.epoch.load(Ordering::Acquire);
        let rows = match self.rows_after(gt).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "shared fetch cache read failed");
                cursor.from_tail = false;
                return (Vec::new(), mark);
            }
        };

        let mut gt = gt;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            if Revision::new(row.after_revision as u64) > gt {
                cursor.from_tail = false;
                break;
            }
            match serde_json::from_str::<ResourceItem>(&row.item) {
                Ok(item) => {
                    gt = Revision::new(row.revision as u64);
                    items.push(item);
                }
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "undecodable shared cache row");
                    cursor.from_tail = false;
                    break;
                }
            }
        }
        (items, mark)
    }

    async fn fill(
        &self,
        cursor: &mut TailCursor,
        loader: &dyn Loader,
        gt: Revision,
        mark: u64,
    ) -> FetchResult<Option<ResourceList>> {
        if self.epoch.load(Ordering::Acquire) != mark {
            return Ok(None);
        }

        match self.has_rows_after(gt).await {
            // Another replica already stored the next page.
            Ok(true) => return Ok(None),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "shared fetch cache check failed");
                cursor.from_tail = false;
                return Ok(None);
            }
        }

        let items = loader.load(gt).await?;
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if !items.is_empty() {
            if let Err(e) = self.store(gt, &items).await {
                tracing::warn!(key = %self.key, error = %e, "shared fetch cache fill failed");
            }
        }
        Ok(Some(items))
    }
}
