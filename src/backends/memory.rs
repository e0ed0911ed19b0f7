//! In-memory backend.
//!
//! Buckets live in a `HashMap` behind an async `RwLock`. Used for dry runs
//! (`"type": "memory"` providers) and as the fixture backend in tests.

use super::{ByteStream, StorageBackend, check_cancelled};
use crate::{
    errors::{BackendError, BackendResult},
    models::{ObjectDescriptor, UploadResult},
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{StreamExt, future, stream};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
struct StoredObject {
    descriptor: ObjectDescriptor,
    data: Bytes,
}

type Bucket = HashMap<String, StoredObject>;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_bucket(&self, bucket: &str) {
        self.buckets
            .write()
            .await
            .entry(bucket.to_string())
            .or_default();
    }

    /// Store `data` under the exact descriptor given, creating the bucket
    /// when needed. Lets callers control `etag` and `last_modified`.
    pub async fn insert(&self, descriptor: ObjectDescriptor, data: impl Into<Bytes>) {
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(descriptor.bucket.clone())
            .or_default()
            .insert(
                descriptor.name.clone(),
                StoredObject {
                    descriptor,
                    data: data.into(),
                },
            );
    }

    /// Store `data` with a content-derived ETag and the current time.
    pub async fn put(
        &self,
        bucket: &str,
        name: &str,
        data: impl Into<Bytes>,
        content_type: &str,
    ) -> ObjectDescriptor {
        let data = data.into();
        let descriptor = describe(bucket, name, &data, content_type);
        self.insert(descriptor.clone(), data).await;
        descriptor
    }

    /// Drop an object directly, bypassing cancellation and bucket checks.
    pub async fn remove(&self, bucket: &str, name: &str) {
        if let Some(objects) = self.buckets.write().await.get_mut(bucket) {
            objects.remove(name);
        }
    }

    /// Payload of an object, if present.
    pub async fn read(&self, bucket: &str, name: &str) -> Option<Bytes> {
        self.buckets
            .read()
            .await
            .get(bucket)
            .and_then(|objects| objects.get(name))
            .map(|stored| stored.data.clone())
    }

    /// Sorted object names of a bucket; empty when the bucket is missing.
    pub async fn object_names(&self, bucket: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .buckets
            .read()
            .await
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn describe(bucket: &str, name: &str, data: &[u8], content_type: &str) -> ObjectDescriptor {
    ObjectDescriptor {
        name: name.to_string(),
        bucket: bucket.to_string(),
        size: data.len() as i64,
        content_type: content_type.to_string(),
        last_modified: Utc::now(),
        etag: format!("{:x}", md5::compute(data)),
        metadata: HashMap::new(),
    }
}

fn missing_bucket(bucket: &str) -> BackendError {
    BackendError::not_found(format!("bucket `{}` not found", bucket))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn list_objects(
        &self,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<HashMap<String, ObjectDescriptor>> {
        check_cancelled(cancel)?;
        let buckets = self.buckets.read().await;
        let objects = buckets.get(bucket).ok_or_else(|| missing_bucket(bucket))?;
        Ok(objects
            .iter()
            .map(|(name, stored)| (name.clone(), stored.descriptor.clone()))
            .collect())
    }

    async fn get_object(
        &self,
        bucket: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<(ObjectDescriptor, ByteStream)> {
        check_cancelled(cancel)?;
        let buckets = self.buckets.read().await;
        let objects = buckets.get(bucket).ok_or_else(|| missing_bucket(bucket))?;
        let stored = objects.get(name).ok_or_else(|| {
            BackendError::not_found(format!("object `{}` not found in bucket `{}`", name, bucket))
        })?;

        let body = stream::once(future::ready(Ok(stored.data.clone()))).boxed();
        Ok((stored.descriptor.clone(), body))
    }

    async fn upload_object(
        &self,
        bucket: &str,
        name: &str,
        mut body: ByteStream,
        size: i64,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<UploadResult> {
        check_cancelled(cancel)?;
        if !self.buckets.read().await.contains_key(bucket) {
            return Err(missing_bucket(bucket));
        }

        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            check_cancelled(cancel)?;
            let chunk =
                chunk.map_err(|err| BackendError::io(format!("read body of `{}`", name), err))?;
            buffer.extend_from_slice(&chunk);
        }
        if buffer.len() as i64 != size {
            return Err(BackendError::invalid_input(format!(
                "object `{}` announced {} bytes but the body held {}",
                name,
                size,
                buffer.len()
            )));
        }

        let data = buffer.freeze();
        let descriptor = describe(bucket, name, &data, content_type);
        let result = UploadResult {
            bucket: bucket.to_string(),
            name: name.to_string(),
            etag: descriptor.etag.clone(),
            size: descriptor.size,
        };

        let mut buckets = self.buckets.write().await;
        let objects = buckets.get_mut(bucket).ok_or_else(|| missing_bucket(bucket))?;
        objects.insert(name.to_string(), StoredObject { descriptor, data });
        Ok(result)
    }

    async fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        check_cancelled(cancel)?;
        let mut buckets = self.buckets.write().await;
        let objects = buckets.get_mut(bucket).ok_or_else(|| missing_bucket(bucket))?;
        objects.remove(name);
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str, cancel: &CancellationToken) -> BackendResult<bool> {
        check_cancelled(cancel)?;
        Ok(self.buckets.read().await.contains_key(bucket))
    }

    async fn ensure_bucket_exists(
        &self,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        check_cancelled(cancel)?;
        self.create_bucket(bucket).await;
        Ok(())
    }

    async fn close(&self) -> BackendResult<()> {
        Ok(())
    }
}
