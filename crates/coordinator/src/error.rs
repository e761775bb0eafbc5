//! Status codes surfaced by the coordinator.

use roster_metadata::MetadataError;
use thiserror::Error;

/// The only failures callers of the coordinator ever see.
///
/// Store internals (corruption, I/O, SQL errors) are logged and collapsed
/// into [`StorageStatusError::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StorageStatusError {
    #[error("not found")]
    NotFound,

    #[error("storage operation failed")]
    Failed,
}

impl StorageStatusError {
    pub fn from_metadata(err: &MetadataError) -> Self {
        if err.is_not_found() {
            Self::NotFound
        } else {
            Self::Failed
        }
    }
}

/// Result type for coordinator operations.
pub type StatusResult<T> = std::result::Result<T, StorageStatusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_collapse_to_failed() {
        assert_eq!(
            StorageStatusError::from_metadata(&MetadataError::NotFound("x".to_string())),
            StorageStatusError::NotFound
        );
        assert_eq!(
            StorageStatusError::from_metadata(&MetadataError::Corruption("x".to_string())),
            StorageStatusError::Failed
        );
    }
}
