//! Forward-only schema migrations for the metadata store.
//!
//! Versions are recorded in `schema_migrations`. All pending migrations run
//! inside one transaction: either the store ends at `CURRENT_SCHEMA_VERSION`
//! or it stays exactly where it was. Every migration inspects the schema
//! before changing it, because a store left behind by an interrupted run may
//! already contain a later migration's tables.

use crate::errors::{StoreError, StoreResult};
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

pub const CURRENT_SCHEMA_VERSION: i64 = 2;

const CREATE_RECORDS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS file_metadata (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mapping_id TEXT NOT NULL,
        object_name TEXT NOT NULL,
        size INTEGER NOT NULL,
        last_modified TIMESTAMP NOT NULL,
        etag TEXT,
        content_type TEXT,
        last_synced TIMESTAMP NOT NULL,
        sync_status TEXT NOT NULL,
        UNIQUE(mapping_id, object_name)
    )";

const CREATE_REKEY_TABLE: &str = "
    CREATE TABLE file_metadata_new (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mapping_id TEXT NOT NULL,
        object_name TEXT NOT NULL,
        size INTEGER NOT NULL,
        last_modified TIMESTAMP NOT NULL,
        etag TEXT,
        content_type TEXT,
        last_synced TIMESTAMP NOT NULL,
        sync_status TEXT NOT NULL,
        UNIQUE(mapping_id, object_name)
    )";

const CREATE_RECORDS_INDEX: &str = "
    CREATE INDEX IF NOT EXISTS idx_file_metadata_mapping_object
    ON file_metadata(mapping_id, object_name)";

/// Bring the store at `pool` up to `CURRENT_SCHEMA_VERSION`.
///
/// Returns the version the store is at afterwards.
pub async fn run(pool: &SqlitePool) -> StoreResult<i64> {
    let mut tx = pool.begin().await.map_err(StoreError::Open)?;

    let current = current_version(&mut tx)
        .await
        .map_err(|source| StoreError::Schema { version: 0, source })?;

    if current >= CURRENT_SCHEMA_VERSION {
        debug!(version = current, "metadata schema is up to date");
        return Ok(current);
    }

    for version in (current + 1)..=CURRENT_SCHEMA_VERSION {
        info!(version, "applying metadata schema migration");
        apply(&mut tx, version)
            .await
            .map_err(|source| StoreError::Schema { version, source })?;

        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|source| StoreError::Schema { version, source })?;
    }

    tx.commit().await.map_err(|source| StoreError::Schema {
        version: CURRENT_SCHEMA_VERSION,
        source,
    })?;

    info!(
        from = current,
        to = CURRENT_SCHEMA_VERSION,
        "metadata schema migrated"
    );
    Ok(CURRENT_SCHEMA_VERSION)
}

/// Highest applied version, creating the bookkeeping table when missing.
async fn current_version(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL
        )",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
        .fetch_one(&mut *conn)
        .await
}

async fn apply(conn: &mut SqliteConnection, version: i64) -> Result<(), sqlx::Error> {
    match version {
        1 => create_base_table(conn).await,
        2 => rekey_by_mapping(conn).await,
        other => Err(sqlx::Error::Protocol(format!(
            "no migration defined for schema version {other}"
        ))),
    }
}

/// Migration 1: the per-object record table and its lookup index.
///
/// A legacy table keyed by bucket name is left untouched for migration 2.
async fn create_base_table(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    let legacy = column_exists(conn, "file_metadata", "bucket_name").await?
        || column_exists(conn, "file_metadata", "source_bucket").await?;
    if legacy {
        debug!("legacy record table found, deferring to re-key migration");
        return Ok(());
    }

    sqlx::query(CREATE_RECORDS_TABLE).execute(&mut *conn).await?;
    sqlx::query(CREATE_RECORDS_INDEX).execute(&mut *conn).await?;
    Ok(())
}

/// Migration 2: partition records by the composite mapping key.
///
/// Rows keyed by a single bucket become `default:<bucket>->default:<bucket>`;
/// rows keyed by a source/target pair become
/// `default:<source>->default:<target>`.
async fn rekey_by_mapping(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    if !table_exists(conn, "file_metadata").await? {
        sqlx::query(CREATE_RECORDS_TABLE).execute(&mut *conn).await?;
        sqlx::query(CREATE_RECORDS_INDEX).execute(&mut *conn).await?;
        return Ok(());
    }

    if column_exists(conn, "file_metadata", "mapping_id").await? {
        sqlx::query(CREATE_RECORDS_INDEX).execute(&mut *conn).await?;
        return Ok(());
    }

    let derived_key = if column_exists(conn, "file_metadata", "bucket_name").await? {
        "'default:' || bucket_name || '->default:' || bucket_name"
    } else if column_exists(conn, "file_metadata", "source_bucket").await? {
        "'default:' || source_bucket || '->default:' || target_bucket"
    } else {
        return Err(sqlx::Error::Protocol(
            "file_metadata has neither mapping_id nor a legacy bucket column".into(),
        ));
    };

    sqlx::query("DROP TABLE IF EXISTS file_metadata_new")
        .execute(&mut *conn)
        .await?;
    sqlx::query(CREATE_REKEY_TABLE).execute(&mut *conn).await?;

    let copy = format!(
        "INSERT OR IGNORE INTO file_metadata_new (
            mapping_id, object_name, size, last_modified, etag,
            content_type, last_synced, sync_status
        )
        SELECT {derived_key}, object_name, size, last_modified, etag,
               content_type, last_synced, sync_status
        FROM file_metadata"
    );
    let copied = sqlx::query(&copy).execute(&mut *conn).await?;
    debug!(rows = copied.rows_affected(), "re-keyed legacy records");

    sqlx::query("DROP TABLE file_metadata")
        .execute(&mut *conn)
        .await?;
    sqlx::query("ALTER TABLE file_metadata_new RENAME TO file_metadata")
        .execute(&mut *conn)
        .await?;
    sqlx::query(CREATE_RECORDS_INDEX).execute(&mut *conn).await?;
    Ok(())
}

async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool, sqlx::Error> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(table)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

async fn column_exists(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> Result<bool, sqlx::Error> {
    let count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count > 0)
}
