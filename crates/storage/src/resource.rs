//! Reader and writer handles scoped to one resource id.

use crate::error::StorageResult;
use crate::traits::{BlobCache, StreamingUpload};
use bytes::Bytes;
use roster_core::ResourceId;
use std::sync::Arc;

/// Reads one resource.
pub struct ResourceReader {
    cache: Arc<dyn BlobCache>,
    id: ResourceId,
}

impl ResourceReader {
    pub fn new(cache: Arc<dyn BlobCache>, id: ResourceId) -> Self {
        Self { cache, id }
    }

    pub fn resource_id(&self) -> ResourceId {
        self.id
    }

    pub async fn size(&self) -> StorageResult<u64> {
        self.cache.size(self.id).await
    }

    pub async fn read_all(&self) -> StorageResult<Bytes> {
        self.cache.read(self.id).await
    }

    pub async fn read_range(&self, start: u64, end: u64) -> StorageResult<Bytes> {
        self.cache.read_range(self.id, start, end).await
    }
}

/// Writes one resource.
///
/// The body becomes visible on [`finish`](Self::finish). A writer dropped
/// without finishing leaves no body behind; its id stays uncommitted and is
/// collected by the next stale resource check.
pub struct ResourceWriter {
    cache: Arc<dyn BlobCache>,
    id: ResourceId,
    upload: Option<Box<dyn StreamingUpload>>,
}

impl ResourceWriter {
    pub fn new(cache: Arc<dyn BlobCache>, id: ResourceId) -> Self {
        Self {
            cache,
            id,
            upload: None,
        }
    }

    pub fn resource_id(&self) -> ResourceId {
        self.id
    }

    /// Append a chunk to the body.
    pub async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        let upload = match self.upload.take() {
            Some(upload) => upload,
            None => self.cache.put_stream(self.id).await?,
        };
        self.upload.insert(upload).write(data).await
    }

    /// Publish the body. Returns its size in bytes.
    pub async fn finish(mut self) -> StorageResult<u64> {
        match self.upload.take() {
            Some(upload) => upload.finish().await,
            None => {
                self.cache.put(self.id, Bytes::new()).await?;
                Ok(0)
            }
        }
    }

    /// Discard everything written so far.
    pub async fn abort(mut self) -> StorageResult<()> {
        match self.upload.take() {
            Some(upload) => upload.abort().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;

    #[tokio::test]
    async fn test_writer_then_reader() {
        let cache: Arc<dyn BlobCache> = Arc::new(MemoryBackend::new(1024));
        let id = ResourceId::new(9);

        let mut writer = ResourceWriter::new(cache.clone(), id);
        writer.write(Bytes::from_static(b"importScripts")).await.unwrap();
        writer.write(Bytes::from_static(b"('a.js');")).await.unwrap();
        assert_eq!(writer.finish().await.unwrap(), 22);

        let reader = ResourceReader::new(cache, id);
        assert_eq!(reader.size().await.unwrap(), 22);
        assert_eq!(
            reader.read_range(0, 13).await.unwrap(),
            Bytes::from_static(b"importScripts")
        );
    }

    #[tokio::test]
    async fn test_empty_body_is_published() {
        let cache: Arc<dyn BlobCache> = Arc::new(MemoryBackend::new(1024));
        let id = ResourceId::new(1);

        let writer = ResourceWriter::new(cache.clone(), id);
        assert_eq!(writer.finish().await.unwrap(), 0);
        assert!(cache.exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_abort_publishes_nothing() {
        let cache: Arc<dyn BlobCache> = Arc::new(MemoryBackend::new(1024));
        let id = ResourceId::new(2);

        let mut writer = ResourceWriter::new(cache.clone(), id);
        writer.write(Bytes::from_static(b"body")).await.unwrap();
        writer.abort().await.unwrap();
        assert!(!cache.exists(id).await.unwrap());
    }
}
