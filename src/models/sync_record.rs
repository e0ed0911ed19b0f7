//! Persisted last-known state of one object within one mapping.

use crate::models::{mapping::MappingKey, object::ObjectDescriptor};
use chrono::{DateTime, Utc};
use std::{convert::Infallible, fmt, str::FromStr};

/// Outcome of the last sync attempt of an object.
///
/// Statuses this binary does not know about decode as `Other` so that a
/// store written by a newer version stays readable; they are never treated
/// as `Success`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    Success,
    FailedGet,
    FailedUpload,
    Other(String),
}

impl SyncStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::FailedGet => "failed_get",
            SyncStatus::FailedUpload => "failed_upload",
            SyncStatus::Other(raw) => raw,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncStatus::Success)
    }
}

impl FromStr for SyncStatus {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "success" => SyncStatus::Success,
            "failed_get" => SyncStatus::FailedGet,
            "failed_upload" => SyncStatus::FailedUpload,
            other => SyncStatus::Other(other.to_string()),
        })
    }
}

impl From<String> for SyncStatus {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(status) => status,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the metadata store, keyed by `(mapping_key, object_name)`.
///
/// Upserts always replace every field.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncRecord {
    pub mapping_key: MappingKey,
    pub object_name: String,

    /// Size in bytes at the last observation.
    pub size: i64,

    /// Source-reported modification time at the last observation.
    pub last_modified: DateTime<Utc>,

    /// Source-reported content fingerprint at the last observation.
    pub etag: String,

    pub content_type: String,

    /// When the last attempt (successful or not) finished.
    pub last_synced_at: DateTime<Utc>,

    pub status: SyncStatus,
}

impl SyncRecord {
    /// Build a record from a source descriptor, stamped with the current time.
    pub fn observed(
        mapping_key: &MappingKey,
        source: &ObjectDescriptor,
        status: SyncStatus,
    ) -> Self {
        Self {
            mapping_key: mapping_key.clone(),
            object_name: source.name.clone(),
            size: source.size,
            last_modified: source.last_modified,
            etag: source.etag.clone(),
            content_type: source.content_type.clone(),
            last_synced_at: Utc::now(),
            status,
        }
    }

    /// True when the object must be transferred again: its fingerprint or
    /// modification time moved, or the previous attempt did not succeed.
    pub fn is_stale_for(&self, source: &ObjectDescriptor) -> bool {
        self.etag != source.etag
            || self.last_modified != source.last_modified
            || !self.status.is_success()
    }
}
