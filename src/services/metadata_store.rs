//! src/services/metadata_store.rs
//!
//! MetadataStore — durable per-object sync state backed by SQLite.
//!
//! Records are keyed by `(mapping_key, object_name)`. The engine decides when
//! to read or write a record; this module owns the SQL and the schema.

use crate::{
    errors::{StoreError, StoreResult},
    models::{MappingKey, SyncRecord, SyncStatus},
    services::migrations,
};
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the metadata database.
///
/// Safe to share between concurrent object workers through an `Arc`:
/// SQLite serializes writers and every upsert is a single statement.
#[derive(Clone, Debug)]
pub struct MetadataStore {
    pool: SqlitePool,
    path: PathBuf,
}

#[derive(Debug, FromRow)]
struct SyncRecordRow {
    mapping_id: String,
    object_name: String,
    size: i64,
    last_modified: DateTime<Utc>,
    etag: Option<String>,
    content_type: Option<String>,
    last_synced: DateTime<Utc>,
    sync_status: String,
}

impl From<SyncRecordRow> for SyncRecord {
    fn from(row: SyncRecordRow) -> Self {
        Self {
            mapping_key: MappingKey::from_raw(row.mapping_id),
            object_name: row.object_name,
            size: row.size,
            last_modified: row.last_modified,
            etag: row.etag.unwrap_or_default(),
            content_type: row.content_type.unwrap_or_default(),
            last_synced_at: row.last_synced,
            status: SyncStatus::from(row.sync_status),
        }
    }
}

impl MetadataStore {
    /// Open (or create) the store at `path` and migrate it to the current
    /// schema version.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(StoreError::Open)?;

        if let Err(err) = migrations::run(&pool).await {
            pool.close().await;
            return Err(err);
        }

        info!(path = %path.display(), "metadata store opened");
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.pool.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Fetch the record for one object; `None` when it was never synchronized.
    pub async fn get(
        &self,
        mapping_key: &MappingKey,
        object_name: &str,
    ) -> StoreResult<Option<SyncRecord>> {
        self.ensure_open()?;
        let row = sqlx::query_as::<_, SyncRecordRow>(
            "SELECT mapping_id, object_name, size, last_modified, etag, content_type,
                    last_synced, sync_status
             FROM file_metadata
             WHERE mapping_id = ? AND object_name = ?",
        )
        .bind(mapping_key.as_str())
        .bind(object_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SyncRecord::from))
    }

    /// Insert the record, or replace every field of the existing one.
    pub async fn upsert(&self, record: &SyncRecord) -> StoreResult<()> {
        self.ensure_open()?;
        if record.object_name.is_empty() {
            return Err(StoreError::InvalidRecord {
                object_name: record.object_name.clone(),
                reason: "object name must not be empty".into(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO file_metadata (
                mapping_id, object_name, size, last_modified, etag,
                content_type, last_synced, sync_status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(mapping_id, object_name) DO UPDATE SET
                size = excluded.size,
                last_modified = excluded.last_modified,
                etag = excluded.etag,
                content_type = excluded.content_type,
                last_synced = excluded.last_synced,
                sync_status = excluded.sync_status
            "#,
        )
        .bind(record.mapping_key.as_str())
        .bind(&record.object_name)
        .bind(record.size)
        .bind(record.last_modified)
        .bind(&record.etag)
        .bind(&record.content_type)
        .bind(record.last_synced_at)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await?;

        debug!(
            mapping = %record.mapping_key,
            object = %record.object_name,
            status = %record.status,
            "upserted sync record"
        );
        Ok(())
    }

    /// Every record the store holds for a mapping, in no particular order.
    pub async fn list_by_mapping(&self, mapping_key: &MappingKey) -> StoreResult<Vec<SyncRecord>> {
        self.ensure_open()?;
        let rows = sqlx::query_as::<_, SyncRecordRow>(
            "SELECT mapping_id, object_name, size, last_modified, etag, content_type,
                    last_synced, sync_status
             FROM file_metadata
             WHERE mapping_id = ?",
        )
        .bind(mapping_key.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SyncRecord::from).collect())
    }

    /// Remove a record. Removing a missing record is not an error.
    pub async fn delete(&self, mapping_key: &MappingKey, object_name: &str) -> StoreResult<()> {
        self.ensure_open()?;
        let result =
            sqlx::query("DELETE FROM file_metadata WHERE mapping_id = ? AND object_name = ?")
                .bind(mapping_key.as_str())
                .bind(object_name)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            debug!(mapping = %mapping_key, object = object_name, "no record to delete");
        }
        Ok(())
    }

    /// Number of records per status for one mapping, sorted by status name.
    pub async fn status_summary(
        &self,
        mapping_key: &MappingKey,
    ) -> StoreResult<Vec<(SyncStatus, i64)>> {
        self.ensure_open()?;
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT sync_status, COUNT(*) FROM file_metadata
             WHERE mapping_id = ?
             GROUP BY sync_status
             ORDER BY sync_status",
        )
        .bind(mapping_key.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(status, count)| (SyncStatus::from(status), count))
            .collect())
    }

    /// Highest migration recorded in the store.
    pub async fn schema_version(&self) -> StoreResult<i64> {
        self.ensure_open()?;
        let version =
            sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;
        Ok(version)
    }

    /// Release the connection pool. Later calls fail with `StoreError::Closed`.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!(path = %self.path.display(), "metadata store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn key() -> MappingKey {
        MappingKey::from_raw("src:photos->dst:backup")
    }

    fn record(name: &str, etag: &str, status: SyncStatus) -> SyncRecord {
        SyncRecord {
            mapping_key: key(),
            object_name: name.to_string(),
            size: 42,
            last_modified: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            etag: etag.to_string(),
            content_type: "text/plain".into(),
            last_synced_at: Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap(),
            status,
        }
    }

    async fn open_temp() -> (TempDir, MetadataStore) {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(dir.path().join("meta/sync.db"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn open_creates_parent_directory_and_schema() {
        let (dir, store) = open_temp().await;
        assert!(dir.path().join("meta/sync.db").exists());
        assert_eq!(
            store.schema_version().await.unwrap(),
            migrations::CURRENT_SCHEMA_VERSION
        );
    }

    #[tokio::test]
    async fn get_missing_record_returns_none() {
        let (_dir, store) = open_temp().await;
        assert!(store.get(&key(), "nope.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_inserts_then_replaces_whole_record() {
        let (_dir, store) = open_temp().await;
        let first = record("a.txt", "E1", SyncStatus::FailedUpload);
        store.upsert(&first).await.unwrap();
        assert_eq!(store.get(&key(), "a.txt").await.unwrap(), Some(first));

        let mut second = record("a.txt", "E2", SyncStatus::Success);
        second.size = 7;
        second.content_type = "application/json".into();
        store.upsert(&second).await.unwrap();
        assert_eq!(store.get(&key(), "a.txt").await.unwrap(), Some(second));
        assert_eq!(store.list_by_mapping(&key()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_by_mapping_is_partitioned() {
        let (_dir, store) = open_temp().await;
        store.upsert(&record("a.txt", "E1", SyncStatus::Success)).await.unwrap();
        store.upsert(&record("b.txt", "E2", SyncStatus::FailedGet)).await.unwrap();

        let mut other = record("a.txt", "E1", SyncStatus::Success);
        other.mapping_key = MappingKey::from_raw("src:photos->dst:other");
        store.upsert(&other).await.unwrap();

        let mut names: Vec<_> = store
            .list_by_mapping(&key())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.object_name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = open_temp().await;
        store.upsert(&record("a.txt", "E1", SyncStatus::Success)).await.unwrap();
        store.delete(&key(), "a.txt").await.unwrap();
        store.delete(&key(), "a.txt").await.unwrap();
        assert!(store.get(&key(), "a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_summary_counts_each_status() {
        let (_dir, store) = open_temp().await;
        store.upsert(&record("a.txt", "E1", SyncStatus::Success)).await.unwrap();
        store.upsert(&record("b.txt", "E1", SyncStatus::Success)).await.unwrap();
        store.upsert(&record("c.txt", "E1", SyncStatus::FailedUpload)).await.unwrap();

        let summary = store.status_summary(&key()).await.unwrap();
        assert_eq!(
            summary,
            vec![(SyncStatus::FailedUpload, 1), (SyncStatus::Success, 2)]
        );
    }

    #[tokio::test]
    async fn reopening_keeps_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.db");
        let store = MetadataStore::open(&path).await.unwrap();
        store.upsert(&record("a.txt", "E1", SyncStatus::Success)).await.unwrap();
        store.close().await;

        let reopened = MetadataStore::open(&path).await.unwrap();
        assert!(reopened.get(&key(), "a.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let (_dir, store) = open_temp().await;
        store.close().await;
        assert!(matches!(
            store.get(&key(), "a.txt").await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            store.upsert(&record("a.txt", "E1", SyncStatus::Success)).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            store.delete(&key(), "a.txt").await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn open_fails_when_parent_is_a_file() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let result = MetadataStore::open(blocker.join("sync.db")).await;
        assert!(matches!(result, Err(StoreError::Io { .. })));
    }
}
