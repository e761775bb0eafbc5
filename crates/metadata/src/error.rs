//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted record: {0}")]
    Corruption(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Whether this is the expected "no such record" outcome.
    ///
    /// Every other variant means the store can no longer be trusted.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<roster_core::Error> for MetadataError {
    fn from(err: roster_core::Error) -> Self {
        match err {
            roster_core::Error::OriginMismatch { .. } | roster_core::Error::InvalidScope(_) => {
                Self::InvalidArguments(err.to_string())
            }
            other => Self::Corruption(other.to_string()),
        }
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
