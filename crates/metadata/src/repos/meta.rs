//! Schema version, id counters and migration flags.

use crate::error::MetadataResult;
use async_trait::async_trait;
use roster_core::{RegistrationId, ResourceId, VersionId};
use serde::Serialize;

/// Next unused value of each id counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NextIds {
    pub registration_id: RegistrationId,
    pub version_id: VersionId,
    pub resource_id: ResourceId,
}

/// Repository for store-wide bookkeeping.
#[async_trait]
pub trait MetaRepo: Send + Sync {
    /// Schema version, or 0 if nothing was ever written.
    async fn read_database_version(&self) -> MetadataResult<i64>;

    /// Next available ids. A store that does not exist yields all zeros.
    async fn get_next_available_ids(&self) -> MetadataResult<NextIds>;

    /// Whether blobs of the previous cache layout still have to be copied.
    ///
    /// False for a new or nonexistent store.
    async fn is_blob_cache_migration_needed(&self) -> MetadataResult<bool>;

    /// Record that blob cache migration is complete.
    async fn set_blob_cache_migration_not_needed(&self) -> MetadataResult<()>;

    /// Whether the directory of the previous cache layout still has to be removed.
    ///
    /// False for a new or nonexistent store.
    async fn is_old_blob_cache_deletion_needed(&self) -> MetadataResult<bool>;

    /// Record that the old cache directory is gone.
    async fn set_old_blob_cache_deletion_not_needed(&self) -> MetadataResult<()>;
}
