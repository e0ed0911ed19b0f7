//! Core data models for bucket synchronization.
//!
//! Mappings come from configuration, descriptors from live backend listings,
//! and sync records from the metadata store.

pub mod mapping;
pub mod object;
pub mod sync_record;

pub use mapping::{Mapping, MappingKey};
pub use object::{ObjectDescriptor, UploadResult};
pub use sync_record::{SyncRecord, SyncStatus};
