use async_trait::async_trait;
use bucket_sync::{
    backends::{BackendRegistry, ByteStream, LocalBackend, MemoryBackend, StorageBackend},
    errors::{BackendError, BackendErrorKind, BackendResult, SyncError},
    models::{Mapping, ObjectDescriptor, SyncStatus, UploadResult},
    services::{MetadataStore, RemovalCounts, SyncCounts, SyncDriver, SyncEngine},
};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use futures::{StreamExt, stream};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Wraps a `MemoryBackend` and fails selected operations on demand.
#[derive(Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    fail_get: Mutex<HashSet<String>>,
    fail_upload: Mutex<HashSet<String>>,
    fail_delete: Mutex<HashSet<String>>,
    list_error: Mutex<Option<BackendErrorKind>>,
    fail_ensure: Mutex<bool>,
    cancel_on_upload: Mutex<Option<CancellationToken>>,
}

impl FlakyBackend {
    fn fail_get(&self, name: &str) {
        self.fail_get.lock().unwrap().insert(name.to_string());
    }

    fn fail_upload(&self, name: &str) {
        self.fail_upload.lock().unwrap().insert(name.to_string());
    }

    fn fail_delete(&self, name: &str) {
        self.fail_delete.lock().unwrap().insert(name.to_string());
    }

    fn heal(&self) {
        self.fail_get.lock().unwrap().clear();
        self.fail_upload.lock().unwrap().clear();
        self.fail_delete.lock().unwrap().clear();
        *self.list_error.lock().unwrap() = None;
        *self.fail_ensure.lock().unwrap() = false;
    }
}

fn injected(kind: BackendErrorKind, what: &str) -> BackendError {
    BackendError::new(kind, format!("injected {} failure", what))
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn list_objects(
        &self,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<HashMap<String, ObjectDescriptor>> {
        let list_error = *self.list_error.lock().unwrap();
        if let Some(kind) = list_error {
            return Err(injected(kind, "list"));
        }
        self.inner.list_objects(bucket, cancel).await
    }

    async fn get_object(
        &self,
        bucket: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<(ObjectDescriptor, ByteStream)> {
        if self.fail_get.lock().unwrap().contains(name) {
            return Err(injected(BackendErrorKind::Io, "get"));
        }
        self.inner.get_object(bucket, name, cancel).await
    }

    async fn upload_object(
        &self,
        bucket: &str,
        name: &str,
        body: ByteStream,
        size: i64,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<UploadResult> {
        let trigger = self.cancel_on_upload.lock().unwrap().clone();
        if let Some(token) = trigger {
            token.cancel();
            return Err(BackendError::cancelled());
        }
        if self.fail_upload.lock().unwrap().contains(name) {
            return Err(injected(BackendErrorKind::Other, "upload"));
        }
        self.inner
            .upload_object(bucket, name, body, size, content_type, cancel)
            .await
    }

    async fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        if self.fail_delete.lock().unwrap().contains(name) {
            return Err(injected(BackendErrorKind::Io, "delete"));
        }
        self.inner.delete_object(bucket, name, cancel).await
    }

    async fn bucket_exists(&self, bucket: &str, cancel: &CancellationToken) -> BackendResult<bool> {
        self.inner.bucket_exists(bucket, cancel).await
    }

    async fn ensure_bucket_exists(
        &self,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        let fail_ensure = *self.fail_ensure.lock().unwrap();
        if fail_ensure {
            return Err(injected(BackendErrorKind::Other, "create bucket"));
        }
        self.inner.ensure_bucket_exists(bucket, cancel).await
    }

    async fn close(&self) -> BackendResult<()> {
        self.inner.close().await
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<MetadataStore>,
    engine: SyncEngine,
    source: Arc<FlakyBackend>,
    target: Arc<FlakyBackend>,
    mapping: Mapping,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path().join("sync.db")).await.unwrap());
        let source = Arc::new(FlakyBackend::default());
        source.inner.create_bucket("src-bucket").await;
        Self {
            _dir: dir,
            engine: SyncEngine::new(store.clone()),
            store,
            source,
            target: Arc::new(FlakyBackend::default()),
            mapping: Mapping::new("src", "src-bucket", "tgt", "tgt-bucket"),
        }
    }

    async fn seed(&self, name: &str, etag: &str, data: &'static str) {
        let descriptor = ObjectDescriptor {
            name: name.to_string(),
            bucket: "src-bucket".into(),
            size: data.len() as i64,
            content_type: "text/plain".into(),
            last_modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            etag: etag.to_string(),
            metadata: HashMap::new(),
        };
        self.source.inner.insert(descriptor, data).await;
    }

    async fn run(&self) -> Result<bucket_sync::services::MappingReport, SyncError> {
        self.run_with(&CancellationToken::new()).await
    }

    async fn run_with(
        &self,
        cancel: &CancellationToken,
    ) -> Result<bucket_sync::services::MappingReport, SyncError> {
        self.engine
            .sync_mapping(&self.mapping, self.source.as_ref(), self.target.as_ref(), cancel)
            .await
    }

    async fn status_of(&self, name: &str) -> Option<SyncStatus> {
        self.store
            .get(&self.mapping.key(), name)
            .await
            .unwrap()
            .map(|record| record.status)
    }
}

#[tokio::test]
async fn first_run_copies_a_new_object() {
    let h = Harness::new().await;
    h.seed("a.txt", "etag-1", "hello").await;

    let report = h.run().await.unwrap();
    assert_eq!(report.sync, SyncCounts { synced: 1, skipped: 0, errored: 0 });
    assert_eq!(report.mapping_key.as_str(), "src:src-bucket->tgt:tgt-bucket");
    assert_eq!(h.target.inner.read("tgt-bucket", "a.txt").await.unwrap(), "hello");
    assert_eq!(h.status_of("a.txt").await, Some(SyncStatus::Success));
}

#[tokio::test]
async fn rerun_without_changes_is_idempotent() {
    let h = Harness::new().await;
    h.seed("a.txt", "etag-1", "hello").await;
    h.seed("b.txt", "etag-2", "world").await;
    h.run().await.unwrap();

    let report = h.run().await.unwrap();
    assert_eq!(report.sync, SyncCounts { synced: 0, skipped: 2, errored: 0 });
    assert_eq!(report.removal, RemovalCounts::default());
}

#[tokio::test]
async fn deleted_source_object_is_removed_with_its_record() {
    let h = Harness::new().await;
    h.seed("a.txt", "etag-1", "hello").await;
    h.run().await.unwrap();

    h.source.inner.remove("src-bucket", "a.txt").await;
    let report = h.run().await.unwrap();
    assert_eq!(report.removal.removed, 1);
    assert!(h.target.inner.object_names("tgt-bucket").await.is_empty());
    assert_eq!(h.status_of("a.txt").await, None);
}

#[tokio::test]
async fn target_converges_to_source() {
    let h = Harness::new().await;
    h.seed("keep.txt", "k1", "keep").await;
    h.seed("change.txt", "c1", "before").await;
    h.target.inner.create_bucket("tgt-bucket").await;
    h.target.inner.put("tgt-bucket", "extra.txt", "stray", "text/plain").await;
    h.run().await.unwrap();

    h.seed("change.txt", "c2", "after").await;
    h.seed("new.txt", "n1", "fresh").await;
    let report = h.run().await.unwrap();
    assert_eq!(report.sync, SyncCounts { synced: 2, skipped: 1, errored: 0 });

    assert_eq!(
        h.target.inner.object_names("tgt-bucket").await,
        h.source.inner.object_names("src-bucket").await
    );
    assert_eq!(h.target.inner.read("tgt-bucket", "change.txt").await.unwrap(), "after");

    let records = h.store.list_by_mapping(&h.mapping.key()).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == SyncStatus::Success));
    let change = records.iter().find(|r| r.object_name == "change.txt").unwrap();
    assert_eq!(change.etag, "c2");
}

#[tokio::test]
async fn failed_upload_is_recorded_and_retried() {
    let h = Harness::new().await;
    h.seed("a.txt", "etag-1", "hello").await;
    h.target.fail_upload("a.txt");

    let report = h.run().await.unwrap();
    assert_eq!(report.sync.errored, 1);
    assert_eq!(h.status_of("a.txt").await, Some(SyncStatus::FailedUpload));

    h.target.heal();
    let report = h.run().await.unwrap();
    assert_eq!(report.sync, SyncCounts { synced: 1, skipped: 0, errored: 0 });
    assert_eq!(h.status_of("a.txt").await, Some(SyncStatus::Success));
}

#[tokio::test]
async fn one_bad_object_does_not_stop_the_rest() {
    let h = Harness::new().await;
    h.seed("a.txt", "a", "one").await;
    h.seed("b.txt", "b", "two").await;
    h.seed("c.txt", "c", "three").await;
    h.source.fail_get("b.txt");

    let report = h.run().await.unwrap();
    assert_eq!(report.total_source_objects, 3);
    assert_eq!(report.sync, SyncCounts { synced: 2, skipped: 0, errored: 1 });
    assert_eq!(h.status_of("b.txt").await, Some(SyncStatus::FailedGet));
    assert_eq!(
        h.target.inner.object_names("tgt-bucket").await,
        vec!["a.txt".to_string(), "c.txt".to_string()]
    );
}

#[tokio::test]
async fn one_failed_upload_does_not_stop_the_rest() {
    let h = Harness::new().await;
    h.seed("a.txt", "a", "one").await;
    h.seed("b.txt", "b", "two").await;
    h.seed("c.txt", "c", "three").await;
    h.target.fail_upload("b.txt");

    let report = h.run().await.unwrap();
    assert_eq!(report.sync, SyncCounts { synced: 2, skipped: 0, errored: 1 });
    assert_eq!(report.errors(), 1);
    assert_eq!(h.status_of("a.txt").await, Some(SyncStatus::Success));
    assert_eq!(h.status_of("b.txt").await, Some(SyncStatus::FailedUpload));
    assert_eq!(h.status_of("c.txt").await, Some(SyncStatus::Success));
    assert_eq!(
        h.target.inner.object_names("tgt-bucket").await,
        vec!["a.txt".to_string(), "c.txt".to_string()]
    );
}

#[tokio::test]
async fn unavailable_store_still_copies_objects() {
    let h = Harness::new().await;
    h.seed("a.txt", "etag-1", "hello").await;
    h.store.close().await;

    let report = h.run().await.unwrap();
    assert_eq!(report.sync, SyncCounts { synced: 1, skipped: 0, errored: 0 });
    assert_eq!(report.removal, RemovalCounts::default());
    assert_eq!(h.target.inner.object_names("tgt-bucket").await, vec!["a.txt".to_string()]);
    assert_eq!(h.target.inner.read("tgt-bucket", "a.txt").await.unwrap(), "hello");
}

#[tokio::test]
async fn failed_delete_keeps_object_and_record() {
    let h = Harness::new().await;
    h.seed("a.txt", "etag-1", "hello").await;
    h.run().await.unwrap();

    h.source.inner.remove("src-bucket", "a.txt").await;
    h.target.fail_delete("a.txt");
    let report = h.run().await.unwrap();
    assert_eq!(report.removal, RemovalCounts { removed: 0, errored: 1, pruned: 0 });
    assert_eq!(report.errors(), 1);
    assert_eq!(h.status_of("a.txt").await, Some(SyncStatus::Success));

    h.target.heal();
    let report = h.run().await.unwrap();
    assert_eq!(report.removal.removed, 1);
    assert_eq!(h.status_of("a.txt").await, None);
}

#[tokio::test]
async fn target_listing_failure_aborts_mapping() {
    let h = Harness::new().await;
    h.seed("a.txt", "etag-1", "hello").await;
    *h.target.list_error.lock().unwrap() = Some(BackendErrorKind::Io);

    let err = h.run().await.unwrap_err();
    assert!(matches!(err, SyncError::ListTarget { ref bucket, .. } if bucket == "tgt-bucket"));
    assert_eq!(h.status_of("a.txt").await, None);
}

#[tokio::test]
async fn missing_target_bucket_is_created() {
    let h = Harness::new().await;
    h.seed("a.txt", "etag-1", "hello").await;
    *h.target.list_error.lock().unwrap() = Some(BackendErrorKind::NotFound);

    let report = h.run().await.unwrap();
    assert_eq!(report.sync.synced, 1);
    assert!(
        h.target
            .bucket_exists("tgt-bucket", &CancellationToken::new())
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn ensure_bucket_failure_aborts_mapping() {
    let h = Harness::new().await;
    h.seed("a.txt", "etag-1", "hello").await;
    *h.target.fail_ensure.lock().unwrap() = true;

    let err = h.run().await.unwrap_err();
    assert!(matches!(err, SyncError::EnsureTarget { .. }));
}

#[tokio::test]
async fn cancellation_stops_copy_and_skips_deletion() {
    let h = Harness::new().await;
    h.seed("a.txt", "a", "one").await;
    h.seed("b.txt", "b", "two").await;
    h.target.inner.put("tgt-bucket", "stale.txt", "old", "text/plain").await;

    let cancel = CancellationToken::new();
    *h.target.cancel_on_upload.lock().unwrap() = Some(cancel.clone());

    let err = h.run_with(&cancel).await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert_eq!(h.status_of("a.txt").await, None);
    assert_eq!(h.status_of("b.txt").await, None);
    assert_eq!(h.target.inner.object_names("tgt-bucket").await, vec!["stale.txt".to_string()]);
}

#[tokio::test]
async fn local_directory_syncs_into_memory() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let local = Arc::new(LocalBackend::new(dir.path().join("objects")));
    local.ensure_bucket_exists("photos", &cancel).await.unwrap();
    for (name, data) in [("2024/cat.jpg", "meow"), ("2024/dog.jpg", "woof")] {
        let body = stream::iter(vec![Ok(Bytes::from_static(data.as_bytes()))]).boxed();
        local
            .upload_object("photos", name, body, data.len() as i64, "image/jpeg", &cancel)
            .await
            .unwrap();
    }

    let memory = Arc::new(MemoryBackend::new());
    let mut registry = BackendRegistry::new();
    registry.register("disk", local.clone());
    registry.register("ram", memory.clone());

    let store = Arc::new(MetadataStore::open(dir.path().join("sync.db")).await.unwrap());
    let driver = SyncDriver::new(registry, SyncEngine::new(store.clone()).with_concurrency(2));
    let mappings = vec![
        Mapping::new("disk", "photos", "ram", "backup"),
        Mapping::new("disk", "missing", "ram", "backup"),
    ];

    let summary = driver.sync_all(&mappings, &cancel).await.unwrap();
    assert_eq!(summary.succeeded().count(), 1);
    assert_eq!(summary.failed().count(), 1);
    assert_eq!(summary.totals().0.synced, 2);
    assert_eq!(memory.read("backup", "2024/dog.jpg").await.unwrap(), "woof");

    let summary = driver.sync_all(&mappings[..1], &cancel).await.unwrap();
    assert_eq!(summary.totals().0, SyncCounts { synced: 0, skipped: 2, errored: 0 });
    store.close().await;
}
