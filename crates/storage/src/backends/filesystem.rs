//! Local filesystem blob cache backend.
//!
//! Each resource is one file under the root, named by its decimal id.

use crate::error::{StorageError, StorageResult};
use crate::traits::{BlobCache, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use roster_core::ResourceId;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Maximum range size for read_range operations (128 MiB).
const MAX_RANGE_SIZE: u64 = 128 * 1024 * 1024;

/// Prefix of in-progress write files. They are never listed.
const TEMP_PREFIX: &str = ".tmp.";

/// Local filesystem blob cache.
pub struct FilesystemBackend {
    root: PathBuf,
    disabled: AtomicBool,
}

impl FilesystemBackend {
    /// Create a new filesystem backend. The root is created by [`BlobCache::init`].
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resource_path(&self, id: ResourceId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn temp_path(&self, id: ResourceId) -> PathBuf {
        self.root.join(format!("{TEMP_PREFIX}{id}.{}", Uuid::new_v4()))
    }

    fn check_enabled(&self) -> StorageResult<()> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(StorageError::Disabled);
        }
        Ok(())
    }
}

#[async_trait]
impl BlobCache for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn init(&self) -> StorageResult<()> {
        self.check_enabled()?;
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, id: ResourceId) -> StorageResult<bool> {
        self.check_enabled()?;
        fs::try_exists(self.resource_path(id))
            .await
            .map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn size(&self, id: ResourceId) -> StorageResult<u64> {
        self.check_enabled()?;
        let metadata = fs::metadata(self.resource_path(id))
            .await
            .map_err(|e| StorageError::from_io(id, e))?;
        Ok(metadata.len())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read(&self, id: ResourceId) -> StorageResult<Bytes> {
        self.check_enabled()?;
        let data = fs::read(self.resource_path(id))
            .await
            .map_err(|e| StorageError::from_io(id, e))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read_range(&self, id: ResourceId, start: u64, end: u64) -> StorageResult<Bytes> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        self.check_enabled()?;
        if end < start {
            return Err(StorageError::InvalidRange(format!(
                "end ({end}) < start ({start})"
            )));
        }
        let range_size = end - start;
        if range_size > MAX_RANGE_SIZE {
            return Err(StorageError::InvalidRange(format!(
                "range size {range_size} exceeds maximum {MAX_RANGE_SIZE} bytes"
            )));
        }
        let len = usize::try_from(range_size).map_err(|_| {
            StorageError::InvalidRange(format!(
                "range size {range_size} exceeds platform address space"
            ))
        })?;

        let mut file = fs::File::open(self.resource_path(id))
            .await
            .map_err(|e| StorageError::from_io(id, e))?;
        let file_len = file.metadata().await?.len();
        if end > file_len {
            return Err(StorageError::InvalidRange(format!(
                "range end {end} past resource size {file_len}"
            )));
        }

        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, id: ResourceId, data: Bytes) -> StorageResult<()> {
        let mut upload = self.put_stream(id).await?;
        if let Err(e) = upload.write(data).await {
            upload.abort().await?;
            return Err(e);
        }
        upload.finish().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn put_stream(&self, id: ResourceId) -> StorageResult<Box<dyn StreamingUpload>> {
        self.check_enabled()?;
        fs::create_dir_all(&self.root).await?;

        // Unique temp name so concurrent writers of one id never share a file
        let temp_path = self.temp_path(id);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file,
            temp_path,
            final_path: self.resource_path(id),
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn doom(&self, id: ResourceId) -> StorageResult<()> {
        self.check_enabled()?;
        match fs::remove_file(self.resource_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list_ids(&self) -> StorageResult<Vec<ResourceId>> {
        self.check_enabled()?;
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(StorageError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            // Use file_type() instead of path.is_file() to avoid following symlinks.
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && let Ok(raw) = name.parse::<u64>()
            {
                ids.push(ResourceId::new(raw));
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn disable(&self) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            tracing::warn!(root = %self.root.display(), "Blob cache disabled");
        }
    }

    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn destroy(&self) -> StorageResult<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }
        self.disabled.store(false, Ordering::SeqCst);
        tracing::info!(root = %self.root.display(), "Blob cache destroyed");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        self.check_enabled()?;
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("blob cache root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("blob cache root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

/// Streaming upload for filesystem backend.
struct FilesystemUpload {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        // Ensure all data is flushed to disk before rename
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
        Ok(())
    }
}
