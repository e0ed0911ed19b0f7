//! Runs every configured mapping through the engine, one after another, and
//! collects the outcomes into a run summary.

use crate::{
    backends::BackendRegistry,
    errors::{ConfigError, SyncError},
    models::Mapping,
    services::sync_engine::{MappingReport, RemovalCounts, SyncCounts, SyncEngine},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Outcome of one mapping within a run.
#[derive(Debug)]
pub struct MappingOutcome {
    pub mapping: Mapping,
    pub result: Result<MappingReport, SyncError>,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub outcomes: Vec<MappingOutcome>,
}

impl RunSummary {
    /// Reports of the mappings that ran to completion.
    pub fn succeeded(&self) -> impl Iterator<Item = &MappingReport> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    /// Mappings that were aborted, with the reason.
    pub fn failed(&self) -> impl Iterator<Item = (&Mapping, &SyncError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|err| (&o.mapping, err)))
    }

    /// Counts summed over every completed mapping.
    pub fn totals(&self) -> (SyncCounts, RemovalCounts) {
        self.succeeded().fold(
            (SyncCounts::default(), RemovalCounts::default()),
            |(sync, removal), report| (sync.merge(report.sync), removal.merge(report.removal)),
        )
    }
}

pub struct SyncDriver {
    registry: BackendRegistry,
    engine: SyncEngine,
}

impl SyncDriver {
    pub fn new(registry: BackendRegistry, engine: SyncEngine) -> Self {
        Self { registry, engine }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Synchronize `mappings` in order. A failing mapping is logged and the
    /// run moves on; once `cancel` fires, the remaining mappings are marked
    /// cancelled without running.
    pub async fn sync_all(
        &self,
        mappings: &[Mapping],
        cancel: &CancellationToken,
    ) -> Result<RunSummary, ConfigError> {
        if mappings.is_empty() {
            return Err(ConfigError::NoMappings);
        }

        info!(mappings = mappings.len(), "starting sync run");
        let mut summary = RunSummary::default();

        for mapping in mappings {
            let result = if cancel.is_cancelled() {
                Err(SyncError::Cancelled)
            } else {
                self.sync_one(mapping, cancel).await
            };

            match &result {
                Ok(report) => info!(
                    mapping = %report.mapping_key,
                    total = report.total_source_objects,
                    synced = report.sync.synced,
                    skipped = report.sync.skipped,
                    errored = report.sync.errored,
                    removed = report.removal.removed,
                    removal_errored = report.removal.errored,
                    pruned = report.removal.pruned,
                    "mapping sync finished"
                ),
                Err(SyncError::Cancelled) => {
                    warn!(mapping = %mapping.key(), "mapping sync cancelled")
                }
                Err(err) => error!(mapping = %mapping.key(), "mapping sync failed: {}", err),
            }

            summary.outcomes.push(MappingOutcome {
                mapping: mapping.clone(),
                result,
            });
        }

        let (sync, removal) = summary.totals();
        info!(
            succeeded = summary.succeeded().count(),
            failed = summary.failed().count(),
            synced = sync.synced,
            skipped = sync.skipped,
            errored = sync.errored + removal.errored,
            removed = removal.removed,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn sync_one(
        &self,
        mapping: &Mapping,
        cancel: &CancellationToken,
    ) -> Result<MappingReport, SyncError> {
        let source = self
            .registry
            .get(&mapping.source_provider_id)
            .map_err(|_| SyncError::UnknownProvider(mapping.source_provider_id.clone()))?;
        let target = self
            .registry
            .get(&mapping.target_provider_id)
            .map_err(|_| SyncError::UnknownProvider(mapping.target_provider_id.clone()))?;

        self.engine
            .sync_mapping(mapping, source.as_ref(), target.as_ref(), cancel)
            .await
    }
}
