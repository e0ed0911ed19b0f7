//! One-way incremental synchronization of object storage buckets.
//!
//! Objects flow from a source bucket to a target bucket per configured
//! [`models::Mapping`]; a SQLite metadata store remembers what was last
//! transferred so repeated runs only copy what changed.

pub mod backends;
pub mod config;
pub mod errors;
pub mod models;
pub mod services;
