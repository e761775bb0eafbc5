//! Shared helpers for metadata store tests.

#![allow(dead_code)]

use roster_core::{Origin, RegistrationData, RegistrationId, ResourceRecord, VersionId, total_size};
use roster_metadata::{MetadataStore, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use url::Url;

/// A file-backed store that cleans up on drop.
pub struct TestMetadata {
    pub sqlite_store: Arc<SqliteStore>,
    pub db_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestMetadata {
    pub fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("Database").join("registrations.db");
        let store = SqliteStore::new(&db_path, None);
        Self {
            sqlite_store: Arc::new(store),
            db_path,
            _temp_dir: temp_dir,
        }
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.sqlite_store.clone()
    }

    /// A second store over the same database file.
    pub fn reopen(&self) -> SqliteStore {
        SqliteStore::new(&self.db_path, None)
    }
}

pub fn url(s: &str) -> Url {
    Url::parse(s).expect("valid test url")
}

pub fn origin(s: &str) -> Origin {
    Origin::parse(s).expect("valid test origin")
}

/// A registration record with its total size filled in from `resources`.
pub fn registration(
    registration_id: u64,
    scope: &str,
    script: &str,
    version_id: u64,
    resources: &[ResourceRecord],
) -> RegistrationData {
    let mut data = RegistrationData::new(
        RegistrationId::new(registration_id),
        url(scope),
        url(script),
        VersionId::new(version_id),
    );
    data.resources_total_size_bytes = total_size(resources);
    data
}

pub fn resource(resource_id: u64, at: &str, size_bytes: u64) -> ResourceRecord {
    ResourceRecord::new(resource_id, url(at), size_bytes)
}
