//! Metadata store abstraction and implementation for roster.
//!
//! This crate provides the durable registration store:
//! - Registration records keyed by origin and registration id
//! - Per-version resource lists and the origin index
//! - Per-registration user data
//! - Uncommitted and purgeable resource id sets
//! - Id counters, schema version and migration flags

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use repos::{DeleteOutcome, NextIds, StoredRegistration, WriteOutcome};
pub use store::{MetadataStore, SqliteStore};

use roster_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
///
/// Nothing touches the disk until the first access.
pub fn from_config(config: &MetadataConfig) -> Arc<dyn MetadataStore> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => Arc::new(SqliteStore::new(path, *query_timeout_secs)),
        MetadataConfig::Memory => Arc::new(SqliteStore::in_memory()),
    }
}
