//! Storage error types.

use roster_core::ResourceId;
use thiserror::Error;

/// Blob cache operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("resource not found: {0}")]
    NotFound(ResourceId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob cache is disabled")]
    Disabled,

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("capacity exceeded: need {needed} bytes, {available} available")]
    CapacityExceeded { needed: u64, available: u64 },

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Map a filesystem error, turning `NotFound` into the typed variant.
    pub(crate) fn from_io(id: ResourceId, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(id)
        } else {
            Self::Io(err)
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
