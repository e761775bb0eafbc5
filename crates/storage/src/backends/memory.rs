//! In-memory blob cache backend with a byte budget.

use crate::error::{StorageError, StorageResult};
use crate::traits::{BlobCache, StreamingUpload};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use roster_core::ResourceId;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::instrument;

#[derive(Default)]
struct Entries {
    blobs: BTreeMap<ResourceId, Bytes>,
    used_bytes: u64,
}

impl Entries {
    /// Insert a body, replacing any previous one, within `max_bytes`.
    fn insert(&mut self, id: ResourceId, data: Bytes, max_bytes: u64) -> StorageResult<()> {
        let replaced = self.blobs.get(&id).map_or(0, |b| b.len() as u64);
        let available = max_bytes - (self.used_bytes - replaced);
        let needed = data.len() as u64;
        if needed > available {
            return Err(StorageError::CapacityExceeded { needed, available });
        }
        self.used_bytes = self.used_bytes - replaced + needed;
        self.blobs.insert(id, data);
        Ok(())
    }
}

/// Bounded in-memory blob cache.
pub struct MemoryBackend {
    max_bytes: u64,
    entries: Arc<Mutex<Entries>>,
    disabled: AtomicBool,
}

impl MemoryBackend {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            entries: Arc::new(Mutex::new(Entries::default())),
            disabled: AtomicBool::new(false),
        }
    }

    /// Bytes currently held.
    pub fn used_bytes(&self) -> u64 {
        self.entries.lock().used_bytes
    }

    fn check_enabled(&self) -> StorageResult<()> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(StorageError::Disabled);
        }
        Ok(())
    }

    fn get(&self, id: ResourceId) -> StorageResult<Bytes> {
        self.check_enabled()?;
        self.entries
            .lock()
            .blobs
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound(id))
    }
}

#[async_trait]
impl BlobCache for MemoryBackend {
    async fn init(&self) -> StorageResult<()> {
        self.check_enabled()
    }

    async fn exists(&self, id: ResourceId) -> StorageResult<bool> {
        self.check_enabled()?;
        Ok(self.entries.lock().blobs.contains_key(&id))
    }

    async fn size(&self, id: ResourceId) -> StorageResult<u64> {
        Ok(self.get(id)?.len() as u64)
    }

    async fn read(&self, id: ResourceId) -> StorageResult<Bytes> {
        self.get(id)
    }

    async fn read_range(&self, id: ResourceId, start: u64, end: u64) -> StorageResult<Bytes> {
        let data = self.get(id)?;
        if end < start || end > data.len() as u64 {
            return Err(StorageError::InvalidRange(format!(
                "[{start}, {end}) of resource {id} with {} bytes",
                data.len()
            )));
        }
        Ok(data.slice(start as usize..end as usize))
    }

    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn put(&self, id: ResourceId, data: Bytes) -> StorageResult<()> {
        self.check_enabled()?;
        self.entries.lock().insert(id, data, self.max_bytes)
    }

    async fn put_stream(&self, id: ResourceId) -> StorageResult<Box<dyn StreamingUpload>> {
        self.check_enabled()?;
        Ok(Box::new(MemoryUpload {
            id,
            buf: BytesMut::new(),
            max_bytes: self.max_bytes,
            entries: self.entries.clone(),
        }))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn doom(&self, id: ResourceId) -> StorageResult<()> {
        self.check_enabled()?;
        let mut entries = self.entries.lock();
        if let Some(data) = entries.blobs.remove(&id) {
            entries.used_bytes -= data.len() as u64;
        }
        Ok(())
    }

    async fn list_ids(&self) -> StorageResult<Vec<ResourceId>> {
        self.check_enabled()?;
        Ok(self.entries.lock().blobs.keys().copied().collect())
    }

    fn disable(&self) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            tracing::warn!("In-memory blob cache disabled");
        }
    }

    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    async fn destroy(&self) -> StorageResult<()> {
        *self.entries.lock() = Entries::default();
        self.disabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.check_enabled()
    }
}

struct MemoryUpload {
    id: ResourceId,
    buf: BytesMut,
    max_bytes: u64,
    entries: Arc<Mutex<Entries>>,
}

#[async_trait]
impl StreamingUpload for MemoryUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        let needed = (self.buf.len() + data.len()) as u64;
        if needed > self.max_bytes {
            return Err(StorageError::CapacityExceeded {
                needed,
                available: self.max_bytes,
            });
        }
        self.buf.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let len = self.buf.len() as u64;
        self.entries
            .lock()
            .insert(self.id, self.buf.freeze(), self.max_bytes)?;
        Ok(len)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}
