//! Uncommitted and purgeable resource id sets.

use crate::error::MetadataResult;
use async_trait::async_trait;
use roster_core::ResourceId;
use std::collections::BTreeSet;

/// Repository for the resource lifecycle sets.
///
/// Writes are set unions and clears are set differences, so every call is
/// idempotent. Writing an id advances the resource counter past it.
#[async_trait]
pub trait ResourceIdRepo: Send + Sync {
    async fn write_uncommitted_resource_ids(&self, ids: &[ResourceId]) -> MetadataResult<()>;

    async fn get_uncommitted_resource_ids(&self) -> MetadataResult<BTreeSet<ResourceId>>;

    async fn clear_uncommitted_resource_ids(&self, ids: &[ResourceId]) -> MetadataResult<()>;

    async fn write_purgeable_resource_ids(&self, ids: &[ResourceId]) -> MetadataResult<()>;

    async fn get_purgeable_resource_ids(&self) -> MetadataResult<BTreeSet<ResourceId>>;

    async fn clear_purgeable_resource_ids(&self, ids: &[ResourceId]) -> MetadataResult<()>;

    /// Move ids from the uncommitted set to the purgeable set in one transaction.
    async fn purge_uncommitted_resource_ids(&self, ids: &[ResourceId]) -> MetadataResult<()>;
}
