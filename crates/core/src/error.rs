//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("opaque origin: {0}")]
    OpaqueOrigin(String),

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("scope {scope} does not belong to origin {origin}")]
    OriginMismatch { scope: String, origin: String },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
