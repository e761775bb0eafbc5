//! Blob cache abstraction and backends for roster.
//!
//! This crate provides:
//! - Resource bodies keyed by resource id with atomic writes
//! - Idempotent doom, disable and destroy for recovery
//! - Scoped resource readers and writers
//! - Migration from the previous on-disk cache layout
//! - Backends: local filesystem and bounded memory

pub mod backends;
pub mod error;
pub mod migration;
pub mod resource;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, memory::MemoryBackend};
pub use error::{StorageError, StorageResult};
pub use resource::{ResourceReader, ResourceWriter};
pub use traits::{BlobCache, StreamingUpload};

use roster_core::config::BlobCacheConfig;
use std::sync::Arc;

/// Create a blob cache from configuration.
pub fn from_config(config: &BlobCacheConfig) -> StorageResult<Arc<dyn BlobCache>> {
    match config {
        BlobCacheConfig::Filesystem { path } => {
            if path.as_os_str().is_empty() {
                return Err(StorageError::Config(
                    "blob cache path must not be empty".to_string(),
                ));
            }
            Ok(Arc::new(FilesystemBackend::new(path)))
        }
        BlobCacheConfig::Memory { max_bytes } => {
            if *max_bytes == 0 {
                return Err(StorageError::Config(
                    "blob cache max_bytes must be greater than zero".to_string(),
                ));
            }
            Ok(Arc::new(MemoryBackend::new(*max_bytes)))
        }
    }
}
