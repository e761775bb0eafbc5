//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory under the store root holding the metadata database.
pub const DATABASE_DIR: &str = "Database";
/// File name of the SQLite database inside [`DATABASE_DIR`].
pub const DATABASE_FILE: &str = "registrations.db";
/// Directory under the store root holding script resources.
pub const BLOB_CACHE_DIR: &str = "ScriptCache";
/// Directory used by the previous blob cache layout.
pub const OLD_BLOB_CACHE_DIR: &str = "Cache";

/// Top-level application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
}

impl AppConfig {
    /// Create an in-memory configuration.
    ///
    /// **For testing only.** Nothing is persisted across restarts.
    pub fn for_testing() -> Self {
        Self {
            store: StoreConfig::in_memory(),
        }
    }
}

/// Registration store configuration.
///
/// When `path` is unset the store runs entirely in memory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory of the store.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Busy timeout for the metadata database in seconds.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Capacity of the in-memory blob cache in bytes.
    #[serde(default = "default_max_memory_cache_bytes")]
    pub max_memory_cache_bytes: u64,
}

fn default_query_timeout_secs() -> u64 {
    5
}

fn default_max_memory_cache_bytes() -> u64 {
    crate::DEFAULT_MEMORY_CACHE_BYTES
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            query_timeout_secs: default_query_timeout_secs(),
            max_memory_cache_bytes: default_max_memory_cache_bytes(),
        }
    }

    pub fn on_disk(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::in_memory()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.is_none()
    }

    pub fn database_dir(&self) -> Option<PathBuf> {
        self.path.as_ref().map(|p| p.join(DATABASE_DIR))
    }

    pub fn blob_cache_path(&self) -> Option<PathBuf> {
        self.path.as_ref().map(|p| p.join(BLOB_CACHE_DIR))
    }

    pub fn old_blob_cache_path(&self) -> Option<PathBuf> {
        self.path.as_ref().map(|p| p.join(OLD_BLOB_CACHE_DIR))
    }

    /// Metadata store settings derived from the root.
    pub fn metadata_config(&self) -> MetadataConfig {
        match self.database_dir() {
            Some(dir) => MetadataConfig::Sqlite {
                path: dir.join(DATABASE_FILE),
                query_timeout_secs: Some(self.query_timeout_secs),
            },
            None => MetadataConfig::Memory,
        }
    }

    /// Blob cache settings derived from the root.
    pub fn blob_cache_config(&self) -> BlobCacheConfig {
        match self.blob_cache_path() {
            Some(path) => BlobCacheConfig::Filesystem { path },
            None => BlobCacheConfig::Memory {
                max_bytes: self.max_memory_cache_bytes,
            },
        }
    }

    /// Validate store configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(path) = &self.path
            && path.as_os_str().is_empty()
        {
            return Err("store.path must not be empty when set".to_string());
        }
        if self.query_timeout_secs == 0 {
            return Err("store.query_timeout_secs must be greater than zero".to_string());
        }
        if self.is_in_memory() && self.max_memory_cache_bytes == 0 {
            return Err("store.max_memory_cache_bytes must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database file.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Busy timeout in seconds.
        #[serde(default)]
        query_timeout_secs: Option<u64>,
    },
    /// Private in-memory SQLite database.
    Memory,
}

/// Blob cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlobCacheConfig {
    /// One file per resource under a root directory.
    Filesystem {
        /// Root directory for resources.
        path: PathBuf,
    },
    /// Bounded in-memory cache.
    Memory {
        #[serde(default = "default_max_memory_cache_bytes")]
        max_bytes: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_store_is_in_memory() {
        let config = StoreConfig::default();
        assert!(config.is_in_memory());
        assert!(matches!(config.metadata_config(), MetadataConfig::Memory));
        assert!(matches!(
            config.blob_cache_config(),
            BlobCacheConfig::Memory { max_bytes } if max_bytes == crate::DEFAULT_MEMORY_CACHE_BYTES
        ));
    }

    #[test]
    fn on_disk_paths_are_derived_from_root() {
        let config = StoreConfig::on_disk("/var/lib/roster");
        match config.metadata_config() {
            MetadataConfig::Sqlite { path, .. } => {
                assert_eq!(path, PathBuf::from("/var/lib/roster/Database/registrations.db"));
            }
            other => panic!("unexpected metadata config: {other:?}"),
        }
        assert_eq!(
            config.blob_cache_path(),
            Some(PathBuf::from("/var/lib/roster/ScriptCache"))
        );
        assert_eq!(
            config.old_blob_cache_path(),
            Some(PathBuf::from("/var/lib/roster/Cache"))
        );
    }

    #[test]
    fn store_config_deserializes_with_defaults() {
        let config: StoreConfig = serde_json::from_str(r#"{"path": "/tmp/roster"}"#).unwrap();
        assert_eq!(config.path, Some(PathBuf::from("/tmp/roster")));
        assert_eq!(config.query_timeout_secs, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut config = StoreConfig::in_memory();
        config.query_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn blob_cache_config_roundtrip() {
        let config = BlobCacheConfig::Memory { max_bytes: 1024 };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"type":"memory","max_bytes":1024}"#);
        let decoded: BlobCacheConfig = serde_json::from_str(&json).unwrap();
        assert!(matches!(decoded, BlobCacheConfig::Memory { max_bytes: 1024 }));
    }
}
