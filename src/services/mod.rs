pub mod metadata_store;
pub mod migrations;
pub mod sync_driver;
pub mod sync_engine;

pub use metadata_store::MetadataStore;
pub use sync_driver::{MappingOutcome, RunSummary, SyncDriver};
pub use sync_engine::{MappingReport, RemovalCounts, SyncCounts, SyncEngine};
