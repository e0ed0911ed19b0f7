//! Storage backend abstraction.
//!
//! Every provider (local filesystem, in-memory, or an external vendor
//! adapter) implements [`StorageBackend`]; the sync engine only ever talks to
//! `Arc<dyn StorageBackend>` and never inspects provider-specific errors.

pub mod local;
pub mod memory;
pub mod registry;

use crate::{
    errors::BackendResult,
    models::{ObjectDescriptor, UploadResult},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::{collections::HashMap, io};
use tokio_util::sync::CancellationToken;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use registry::BackendRegistry;

/// Object payload streamed between backends without full buffering.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Capability set required of any storage provider.
///
/// All operations accept the run's cancellation token and must stop promptly
/// once it fires, reporting `BackendErrorKind::Cancelled`. An upload that is
/// cancelled or whose stream fails must not leave a complete-looking object
/// behind.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Every object in `bucket`, keyed by name.
    ///
    /// A missing bucket is reported with `BackendErrorKind::NotFound`.
    async fn list_objects(
        &self,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<HashMap<String, ObjectDescriptor>>;

    /// Open an object for reading.
    async fn get_object(
        &self,
        bucket: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<(ObjectDescriptor, ByteStream)>;

    /// Write `body` as `name`; `size` is the byte count the caller expects.
    async fn upload_object(
        &self,
        bucket: &str,
        name: &str,
        body: ByteStream,
        size: i64,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<UploadResult>;

    async fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()>;

    async fn bucket_exists(&self, bucket: &str, cancel: &CancellationToken) -> BackendResult<bool>;

    /// Create `bucket` unless it already exists.
    async fn ensure_bucket_exists(&self, bucket: &str, cancel: &CancellationToken)
    -> BackendResult<()>;

    /// Release any resources held by the backend.
    async fn close(&self) -> BackendResult<()>;
}

/// Fail fast with `Cancelled` once the token has fired.
pub(crate) fn check_cancelled(cancel: &CancellationToken) -> BackendResult<()> {
    if cancel.is_cancelled() {
        return Err(crate::errors::BackendError::cancelled());
    }
    Ok(())
}
