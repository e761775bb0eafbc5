//! Blob cache trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use roster_core::ResourceId;

/// A cache of script resource bodies keyed by resource id.
///
/// Once disabled, every operation fails with [`StorageError::Disabled`]
/// until [`BlobCache::destroy`] wipes and re-arms the cache.
///
/// [`StorageError::Disabled`]: crate::error::StorageError::Disabled
#[async_trait]
pub trait BlobCache: Send + Sync {
    /// Prepare the backend for use. Safe to call more than once.
    async fn init(&self) -> StorageResult<()>;

    /// Check if a resource exists.
    async fn exists(&self, id: ResourceId) -> StorageResult<bool>;

    /// Size of a stored resource in bytes.
    async fn size(&self, id: ResourceId) -> StorageResult<u64>;

    /// Read a whole resource.
    async fn read(&self, id: ResourceId) -> StorageResult<Bytes>;

    /// Read bytes `[start, end)` of a resource.
    async fn read_range(&self, id: ResourceId, start: u64, end: u64) -> StorageResult<Bytes>;

    /// Store a resource, replacing any previous body.
    async fn put(&self, id: ResourceId, data: Bytes) -> StorageResult<()>;

    /// Start a streaming write. Nothing is visible until `finish`.
    async fn put_stream(&self, id: ResourceId) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete a resource. Deleting a missing resource succeeds.
    async fn doom(&self, id: ResourceId) -> StorageResult<()>;

    /// Ids of every stored resource, ascending.
    async fn list_ids(&self) -> StorageResult<Vec<ResourceId>>;

    /// Reject all further operations.
    fn disable(&self);

    fn is_disabled(&self) -> bool;

    /// Remove every stored resource and re-enable the cache.
    async fn destroy(&self) -> StorageResult<()>;

    /// Get the backend name for logging/metrics.
    fn backend_name(&self) -> &'static str;

    /// Check backend connectivity and health.
    async fn health_check(&self) -> StorageResult<()>;
}

/// Streaming upload handle.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and publish the resource. Returns total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload, leaving no resource behind.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
