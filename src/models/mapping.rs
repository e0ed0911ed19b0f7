//! Represents a configured source-bucket to target-bucket pairing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single synchronization pairing, loaded once from configuration and
/// never mutated afterwards.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    /// Provider id the objects are read from.
    pub source_provider_id: String,

    /// Bucket objects are read from.
    pub source_bucket: String,

    /// Provider id the objects are written to.
    pub target_provider_id: String,

    /// Bucket objects are written to.
    pub target_bucket: String,
}

impl Mapping {
    pub fn new(
        source_provider_id: impl Into<String>,
        source_bucket: impl Into<String>,
        target_provider_id: impl Into<String>,
        target_bucket: impl Into<String>,
    ) -> Self {
        Self {
            source_provider_id: source_provider_id.into(),
            source_bucket: source_bucket.into(),
            target_provider_id: target_provider_id.into(),
            target_bucket: target_bucket.into(),
        }
    }

    /// Partition key used by the metadata store for this mapping.
    pub fn key(&self) -> MappingKey {
        MappingKey(format!(
            "{}:{}->{}:{}",
            self.source_provider_id, self.source_bucket, self.target_provider_id, self.target_bucket
        ))
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Stable, human-readable identifier of a mapping:
/// `sourceProvider:sourceBucket->targetProvider:targetBucket`.
///
/// The format is persisted as the metadata partition key and must not change.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MappingKey(String);

impl MappingKey {
    /// Wrap an already formatted key, e.g. one read back from the store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MappingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
