//! src/services/sync_engine.rs
//!
//! SyncEngine — one-way incremental synchronization of a single mapping.
//!
//! A run lists both buckets, copies every source object whose stored record
//! is missing, stale, or failed, removes target objects that vanished from
//! the source, and finally drops records no bucket refers to anymore.

use crate::{
    backends::StorageBackend,
    errors::{BackendError, SyncError},
    models::{Mapping, MappingKey, ObjectDescriptor, SyncRecord, SyncStatus},
    services::metadata_store::MetadataStore,
};
use futures::{StreamExt, future, stream};
use std::{collections::HashMap, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counts from the copy pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub synced: usize,
    pub skipped: usize,
    pub errored: usize,
}

impl SyncCounts {
    pub fn merge(self, other: SyncCounts) -> Self {
        Self {
            synced: self.synced + other.synced,
            skipped: self.skipped + other.skipped,
            errored: self.errored + other.errored,
        }
    }

    fn record(mut self, outcome: ObjectOutcome) -> Self {
        match outcome {
            ObjectOutcome::Synced => self.synced += 1,
            ObjectOutcome::Skipped => self.skipped += 1,
            ObjectOutcome::Failed => self.errored += 1,
            ObjectOutcome::Cancelled => {}
        }
        self
    }
}

/// Counts from the deletion pass and orphan pruning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemovalCounts {
    pub removed: usize,
    pub errored: usize,
    /// Records dropped because their object is gone from both buckets.
    pub pruned: usize,
}

impl RemovalCounts {
    pub fn merge(self, other: RemovalCounts) -> Self {
        Self {
            removed: self.removed + other.removed,
            errored: self.errored + other.errored,
            pruned: self.pruned + other.pruned,
        }
    }
}

/// Result of synchronizing one mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappingReport {
    pub mapping_key: MappingKey,
    pub total_source_objects: usize,
    pub sync: SyncCounts,
    pub removal: RemovalCounts,
}

impl MappingReport {
    pub fn errors(&self) -> usize {
        self.sync.errored + self.removal.errored
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ObjectOutcome {
    Synced,
    Skipped,
    Failed,
    Cancelled,
}

/// Drives a mapping's buckets towards convergence using the metadata store
/// to decide what changed since the last run.
#[derive(Clone, Debug)]
pub struct SyncEngine {
    store: Arc<MetadataStore>,
    concurrency: usize,
}

impl SyncEngine {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self {
            store,
            concurrency: 1,
        }
    }

    /// Allow up to `concurrency` object transfers in flight. Zero is treated
    /// as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Synchronize `mapping` from `source` into `target`.
    ///
    /// Object-level failures are counted and recorded in the store; only
    /// listing the buckets, preparing the target bucket, or cancellation
    /// abort the mapping.
    pub async fn sync_mapping(
        &self,
        mapping: &Mapping,
        source: &dyn StorageBackend,
        target: &dyn StorageBackend,
        cancel: &CancellationToken,
    ) -> Result<MappingReport, SyncError> {
        let mapping_key = mapping.key();
        info!(mapping = %mapping_key, "starting mapping sync");

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let source_objects = source
            .list_objects(&mapping.source_bucket, cancel)
            .await
            .map_err(|err| {
                abort_or_cancel(err, |source| SyncError::ListSource {
                    bucket: mapping.source_bucket.clone(),
                    source,
                })
            })?;

        let target_objects = match target.list_objects(&mapping.target_bucket, cancel).await {
            Ok(objects) => objects,
            Err(err) if err.is_not_found() => {
                debug!(
                    mapping = %mapping_key,
                    bucket = %mapping.target_bucket,
                    "target bucket missing, treating as empty"
                );
                HashMap::new()
            }
            Err(err) => {
                return Err(abort_or_cancel(err, |source| SyncError::ListTarget {
                    bucket: mapping.target_bucket.clone(),
                    source,
                }));
            }
        };

        target
            .ensure_bucket_exists(&mapping.target_bucket, cancel)
            .await
            .map_err(|err| {
                abort_or_cancel(err, |source| SyncError::EnsureTarget {
                    bucket: mapping.target_bucket.clone(),
                    source,
                })
            })?;

        info!(
            mapping = %mapping_key,
            source_objects = source_objects.len(),
            target_objects = target_objects.len(),
            "listed buckets"
        );

        // --- Copy pass ---
        let sync = stream::iter(source_objects.values())
            .map(|object| self.sync_object(&mapping_key, mapping, object, source, target, cancel))
            .buffer_unordered(self.concurrency)
            .fold(SyncCounts::default(), |counts, outcome| {
                future::ready(counts.record(outcome))
            })
            .await;

        if cancel.is_cancelled() {
            warn!(
                mapping = %mapping_key,
                synced = sync.synced,
                "mapping sync cancelled during copy pass"
            );
            return Err(SyncError::Cancelled);
        }
        info!(
            mapping = %mapping_key,
            synced = sync.synced,
            skipped = sync.skipped,
            errored = sync.errored,
            "copy pass finished"
        );

        // --- Deletion pass ---
        let mut removal = self
            .remove_deleted(&mapping_key, mapping, &source_objects, &target_objects, target, cancel)
            .await?;

        // --- Orphan records ---
        removal.pruned = self
            .prune_orphans(&mapping_key, &source_objects, &target_objects)
            .await;

        info!(
            mapping = %mapping_key,
            removed = removal.removed,
            errored = removal.errored,
            pruned = removal.pruned,
            "deletion pass finished"
        );

        Ok(MappingReport {
            mapping_key,
            total_source_objects: source_objects.len(),
            sync,
            removal,
        })
    }

    async fn sync_object(
        &self,
        mapping_key: &MappingKey,
        mapping: &Mapping,
        object: &ObjectDescriptor,
        source: &dyn StorageBackend,
        target: &dyn StorageBackend,
        cancel: &CancellationToken,
    ) -> ObjectOutcome {
        if cancel.is_cancelled() {
            return ObjectOutcome::Cancelled;
        }

        let needs_sync = match self.store.get(mapping_key, &object.name).await {
            Ok(Some(record)) => record.is_stale_for(object),
            Ok(None) => true,
            Err(err) => {
                warn!(
                    mapping = %mapping_key,
                    object = %object.name,
                    "cannot read sync record, resyncing: {}",
                    err
                );
                true
            }
        };
        if !needs_sync {
            debug!(mapping = %mapping_key, object = %object.name, "unchanged, skipping");
            return ObjectOutcome::Skipped;
        }

        let opened = source
            .get_object(&mapping.source_bucket, &object.name, cancel)
            .await;
        let (_, body) = match opened {
            Ok(opened) => opened,
            Err(err) if err.is_cancelled() => return ObjectOutcome::Cancelled,
            Err(err) => {
                error!(
                    mapping = %mapping_key,
                    object = %object.name,
                    "failed to read source object: {}",
                    err
                );
                self.record(mapping_key, object, SyncStatus::FailedGet).await;
                return ObjectOutcome::Failed;
            }
        };

        match target
            .upload_object(
                &mapping.target_bucket,
                &object.name,
                body,
                object.size,
                &object.content_type,
                cancel,
            )
            .await
        {
            Ok(uploaded) => {
                debug!(
                    mapping = %mapping_key,
                    object = %object.name,
                    etag = %uploaded.etag,
                    size = uploaded.size,
                    "object synced"
                );
                self.record(mapping_key, object, SyncStatus::Success).await;
                ObjectOutcome::Synced
            }
            Err(err) if err.is_cancelled() => ObjectOutcome::Cancelled,
            Err(err) => {
                error!(
                    mapping = %mapping_key,
                    object = %object.name,
                    "failed to upload object: {}",
                    err
                );
                self.record(mapping_key, object, SyncStatus::FailedUpload).await;
                ObjectOutcome::Failed
            }
        }
    }

    /// Persist the attempt; a store failure is logged and does not change
    /// the object's outcome.
    async fn record(
        &self,
        mapping_key: &MappingKey,
        object: &ObjectDescriptor,
        status: SyncStatus,
    ) {
        let record = SyncRecord::observed(mapping_key, object, status);
        if let Err(err) = self.store.upsert(&record).await {
            error!(
                mapping = %mapping_key,
                object = %object.name,
                status = %record.status,
                "failed to save sync record: {}",
                err
            );
        }
    }

    async fn remove_deleted(
        &self,
        mapping_key: &MappingKey,
        mapping: &Mapping,
        source_objects: &HashMap<String, ObjectDescriptor>,
        target_objects: &HashMap<String, ObjectDescriptor>,
        target: &dyn StorageBackend,
        cancel: &CancellationToken,
    ) -> Result<RemovalCounts, SyncError> {
        let mut counts = RemovalCounts::default();

        for name in target_objects.keys().filter(|name| !source_objects.contains_key(*name)) {
            if cancel.is_cancelled() {
                warn!(
                    mapping = %mapping_key,
                    removed = counts.removed,
                    "mapping sync cancelled during deletion pass"
                );
                return Err(SyncError::Cancelled);
            }

            match target.delete_object(&mapping.target_bucket, name, cancel).await {
                Ok(()) => {
                    debug!(mapping = %mapping_key, object = %name, "removed from target");
                    if let Err(err) = self.store.delete(mapping_key, name).await {
                        error!(
                            mapping = %mapping_key,
                            object = %name,
                            "failed to delete sync record: {}",
                            err
                        );
                    }
                    counts.removed += 1;
                }
                Err(err) if err.is_cancelled() => return Err(SyncError::Cancelled),
                Err(err) => {
                    error!(
                        mapping = %mapping_key,
                        object = %name,
                        "failed to remove object from target: {}",
                        err
                    );
                    counts.errored += 1;
                }
            }
        }

        Ok(counts)
    }

    async fn prune_orphans(
        &self,
        mapping_key: &MappingKey,
        source_objects: &HashMap<String, ObjectDescriptor>,
        target_objects: &HashMap<String, ObjectDescriptor>,
    ) -> usize {
        let records = match self.store.list_by_mapping(mapping_key).await {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    mapping = %mapping_key,
                    "cannot list sync records, skipping pruning: {}",
                    err
                );
                return 0;
            }
        };

        let mut pruned = 0;
        for record in records.iter().filter(|record| {
            !source_objects.contains_key(&record.object_name)
                && !target_objects.contains_key(&record.object_name)
        }) {
            match self.store.delete(mapping_key, &record.object_name).await {
                Ok(()) => {
                    debug!(
                        mapping = %mapping_key,
                        object = %record.object_name,
                        "pruned orphan record"
                    );
                    pruned += 1;
                }
                Err(err) => {
                    warn!(
                        mapping = %mapping_key,
                        object = %record.object_name,
                        "failed to prune orphan record: {}",
                        err
                    );
                }
            }
        }
        pruned
    }
}

fn abort_or_cancel(err: BackendError, wrap: impl FnOnce(BackendError) -> SyncError) -> SyncError {
    if err.is_cancelled() {
        SyncError::Cancelled
    } else {
        wrap(err)
    }
}
