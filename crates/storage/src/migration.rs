//! Migration from the previous on-disk cache layout.
//!
//! The old layout kept one file per resource id directly under its own
//! directory. Migration copies each of those into the current cache and
//! leaves deleting the old directory as a separate step, so a crash in
//! between only repeats the copy.

use crate::error::{StorageError, StorageResult};
use crate::traits::BlobCache;
use bytes::Bytes;
use roster_core::ResourceId;
use std::path::Path;
use tokio::fs;

/// Copy every resource of the old layout into `cache`.
///
/// Returns the number of resources copied. A missing old directory copies nothing.
pub async fn migrate_old_cache(old_dir: &Path, cache: &dyn BlobCache) -> StorageResult<usize> {
    let mut entries = match fs::read_dir(old_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StorageError::Io(e)),
    };

    cache.init().await?;
    let mut copied = 0;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok())
            .map(ResourceId::new)
        else {
            tracing::debug!(path = %entry.path().display(), "Skipping non-resource file");
            continue;
        };
        let data = fs::read(entry.path()).await?;
        cache.put(id, Bytes::from(data)).await?;
        copied += 1;
    }

    tracing::info!(copied, from = %old_dir.display(), "Migrated old blob cache");
    Ok(copied)
}

/// Remove the old cache directory. Missing is success.
pub async fn delete_old_cache(old_dir: &Path) -> StorageResult<()> {
    match fs::remove_dir_all(old_dir).await {
        Ok(()) => {
            tracing::info!(path = %old_dir.display(), "Deleted old blob cache");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Io(e)),
    }
}
