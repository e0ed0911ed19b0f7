//! Represents an object as observed live in a backend listing.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A single object (blob) within a bucket, as reported by a backend.
///
/// Descriptors are produced fresh on every run and never cached; the only
/// state carried between runs is the persisted `SyncRecord`.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectDescriptor {
    /// Object key (path-like identifier within the bucket).
    pub name: String,

    /// Bucket the object was listed from.
    pub bucket: String,

    /// Size in bytes.
    pub size: i64,

    /// Content type (MIME type).
    pub content_type: String,

    /// Backend-reported modification timestamp.
    pub last_modified: DateTime<Utc>,

    /// Backend-defined content fingerprint.
    pub etag: String,

    /// User-defined metadata attached to the object.
    pub metadata: HashMap<String, String>,
}

/// Result of a successful upload as reported by the target backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadResult {
    pub bucket: String,
    pub name: String,
    pub etag: String,
    pub size: i64,
}
