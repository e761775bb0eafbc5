//! Per-version map from script URL to cached resource.

use crate::coordinator::StorageCoordinator;
use roster_core::{ResourceId, ResourceRecord, VersionStatus};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptCacheError {
    #[error("version in status {0:?} does not accept new resources")]
    NotAcceptingResources(VersionStatus),

    #[error("already caching {0}")]
    AlreadyCaching(Url),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheEntry {
    url: Url,
    resource_id: ResourceId,
    /// Unknown until caching finishes.
    size_bytes: Option<u64>,
}

/// Scripts cached for one version, in the order they started caching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCacheMap {
    main_script_url: Url,
    entries: Vec<CacheEntry>,
    main_script_error: Option<String>,
}

impl ScriptCacheMap {
    pub fn new(main_script_url: Url) -> Self {
        Self {
            main_script_url,
            entries: Vec::new(),
            main_script_error: None,
        }
    }

    pub fn main_script_url(&self) -> &Url {
        &self.main_script_url
    }

    pub fn main_script_error(&self) -> Option<&str> {
        self.main_script_error.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, url: &Url) -> Option<&CacheEntry> {
        self.entries.iter().find(|e| &e.url == url)
    }

    pub fn lookup_resource_id(&self, url: &Url) -> Option<ResourceId> {
        self.entry(url).map(|e| e.resource_id)
    }

    /// `None` when the url is unknown or still caching.
    pub fn lookup_resource_size(&self, url: &Url) -> Option<u64> {
        self.entry(url).and_then(|e| e.size_bytes)
    }

    /// Start caching `url` into `resource_id`.
    ///
    /// The id is recorded as uncommitted before any bytes are written.
    pub fn notify_started_caching(
        &mut self,
        status: VersionStatus,
        url: Url,
        resource_id: ResourceId,
        storage: &StorageCoordinator,
    ) -> Result<(), ScriptCacheError> {
        if !status.accepts_new_resources() {
            return Err(ScriptCacheError::NotAcceptingResources(status));
        }
        if self.entry(&url).is_some() {
            return Err(ScriptCacheError::AlreadyCaching(url));
        }
        self.entries.push(CacheEntry {
            url,
            resource_id,
            size_bytes: None,
        });
        storage.store_uncommitted_resource_id(resource_id);
        Ok(())
    }

    /// Finish caching `url`. On failure the resource is doomed and forgotten.
    pub fn notify_finished_caching(
        &mut self,
        url: &Url,
        size_bytes: u64,
        result: Result<(), String>,
        storage: &StorageCoordinator,
    ) {
        let Some(index) = self.entries.iter().position(|e| &e.url == url) else {
            tracing::debug!(%url, "Finished caching an unknown script");
            return;
        };
        match result {
            Ok(()) => self.entries[index].size_bytes = Some(size_bytes),
            Err(message) => {
                let entry = self.entries.remove(index);
                tracing::warn!(
                    %url,
                    resource_id = %entry.resource_id,
                    %message,
                    "Script caching failed"
                );
                storage.doom_uncommitted_resource(entry.resource_id);
                if url == &self.main_script_url {
                    self.main_script_error = Some(message);
                }
            }
        }
    }

    /// Resources in caching order. Unknown sizes are reported as zero.
    pub fn get_resources(&self) -> Vec<ResourceRecord> {
        self.entries
            .iter()
            .map(|e| ResourceRecord::new(e.resource_id, e.url.clone(), e.size_bytes.unwrap_or(0)))
            .collect()
    }

    /// Replace the contents with a stored resource list.
    pub fn set_resources(&mut self, resources: &[ResourceRecord]) {
        self.entries = resources
            .iter()
            .map(|r| CacheEntry {
                url: r.url.clone(),
                resource_id: r.resource_id,
                size_bytes: Some(r.size_bytes),
            })
            .collect();
    }

    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.entries.iter().map(|e| e.resource_id).collect()
    }
}
