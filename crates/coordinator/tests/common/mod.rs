//! Shared helpers for coordinator tests.

#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use roster_core::config::StoreConfig;
use roster_core::{Origin, RegistrationId, ResourceId, VersionId, VersionStatus};
use roster_coordinator::{
    CoordinatorOptions, LiveRegistration, LiveVersion, QuotaObserver, SessionPolicy,
    StorageCoordinator, StorageEvent,
};
use roster_metadata::SqliteStore;
use roster_storage::{BlobCache, FilesystemBackend, MemoryBackend};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use url::Url;

pub fn url(s: &str) -> Url {
    Url::parse(s).expect("valid test url")
}

pub fn origin(s: &str) -> Origin {
    Origin::parse(s).expect("valid test origin")
}

/// Records every size change reported by the coordinator.
#[derive(Default)]
pub struct RecordingQuota {
    deltas: Mutex<Vec<(Origin, i64)>>,
}

impl RecordingQuota {
    pub fn deltas(&self) -> Vec<(Origin, i64)> {
        self.deltas.lock().clone()
    }
}

impl QuotaObserver for RecordingQuota {
    fn notify_storage_modified(&self, origin: &Origin, delta: i64) {
        self.deltas.lock().push((origin.clone(), delta));
    }
}

/// Marks a fixed set of origins as session-only.
pub struct SessionOnly(pub BTreeSet<Origin>);

impl SessionPolicy for SessionOnly {
    fn has_session_only_origins(&self) -> bool {
        !self.0.is_empty()
    }

    fn is_session_only(&self, origin: &Origin) -> bool {
        self.0.contains(origin)
    }
}

/// A coordinator over an in-memory store and blob cache.
pub struct TestStorage {
    pub coordinator: StorageCoordinator,
    pub store: Arc<SqliteStore>,
    pub cache: Arc<dyn BlobCache>,
    pub quota: Arc<RecordingQuota>,
    pub events: broadcast::Receiver<StorageEvent>,
}

impl TestStorage {
    pub fn in_memory() -> Self {
        Self::with_parts(
            Arc::new(SqliteStore::in_memory()),
            Arc::new(MemoryBackend::new(1024 * 1024)),
            CoordinatorOptions::default(),
        )
    }

    pub fn with_parts(
        store: Arc<SqliteStore>,
        cache: Arc<dyn BlobCache>,
        options: CoordinatorOptions,
    ) -> Self {
        let quota = Arc::new(RecordingQuota::default());
        let options = CoordinatorOptions {
            quota: Some(quota.clone()),
            ..options
        };
        let coordinator = StorageCoordinator::spawn(store.clone(), cache.clone(), options);
        let events = coordinator.subscribe();
        Self {
            coordinator,
            store,
            cache,
            quota,
            events,
        }
    }

    /// Wait for the first event matching `pred`, skipping the others.
    pub async fn wait_for(&mut self, pred: impl Fn(&StorageEvent) -> bool) -> StorageEvent {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for storage event")
    }

    pub async fn wait_for_purge(&mut self, resource_id: ResourceId) {
        self.wait_for(|e| *e == StorageEvent::ResourcePurged { resource_id })
            .await;
    }

    /// Cache one script body and record it in the version's script cache map.
    pub async fn cache_script(
        &self,
        version_id: VersionId,
        script: &Url,
        body: &[u8],
    ) -> ResourceId {
        let coordinator = &self.coordinator;
        let resource_id = coordinator.new_resource_id().await.unwrap();
        coordinator
            .live()
            .with_version_mut(version_id, |v| {
                let status = v.status;
                v.script_cache_map
                    .notify_started_caching(status, script.clone(), resource_id, coordinator)
            })
            .expect("version is live")
            .unwrap();

        let mut writer = coordinator.create_resource_writer(resource_id).await.unwrap();
        writer.write(Bytes::copy_from_slice(body)).await.unwrap();
        let size = writer.finish().await.unwrap();

        coordinator.live().with_version_mut(version_id, |v| {
            v.script_cache_map
                .notify_finished_caching(script, size, Ok(()), coordinator)
        });
        resource_id
    }

    /// Create a live registration whose new version caches `scripts`.
    ///
    /// The first script is the main script. Nothing is stored yet.
    pub async fn install(
        &self,
        scope: &str,
        scripts: &[(&str, &[u8])],
        active: bool,
    ) -> Installed {
        let coordinator = &self.coordinator;
        let registration_id = coordinator.new_registration_id().await.unwrap();
        let version_id = coordinator.new_version_id().await.unwrap();
        let main_script = url(scripts[0].0);

        let live = coordinator.live();
        live.insert_registration(LiveRegistration::new(registration_id, url(scope)));
        let mut version = LiveVersion::new(version_id, registration_id, main_script);
        version.status = VersionStatus::Installing;
        live.insert_version(version);

        let mut resource_ids = Vec::new();
        for (script, body) in scripts {
            resource_ids.push(self.cache_script(version_id, &url(script), body).await);
        }

        live.with_version_mut(version_id, |v| {
            v.status = if active {
                VersionStatus::Activated
            } else {
                VersionStatus::Installed
            };
        });
        live.with_registration_mut(registration_id, |r| {
            if active {
                r.active_version = Some(version_id);
            } else {
                r.waiting_version = Some(version_id);
            }
        });

        Installed {
            registration_id,
            version_id,
            resource_ids,
        }
    }

    /// Install and store in one go.
    pub async fn install_and_store(&self, scope: &str, scripts: &[(&str, &[u8])]) -> Installed {
        let installed = self.install(scope, scripts, true).await;
        self.coordinator
            .store_registration(installed.registration_id, installed.version_id)
            .await
            .unwrap();
        installed
    }

    /// Forget every live object so lookups go to the store.
    pub fn evict_all(&self, installed: &Installed) {
        let live = self.coordinator.live();
        live.evict_registration(installed.registration_id);
        live.evict_version(installed.version_id);
    }
}

#[derive(Debug, Clone)]
pub struct Installed {
    pub registration_id: RegistrationId,
    pub version_id: VersionId,
    pub resource_ids: Vec<ResourceId>,
}

/// An on-disk store root that is cleaned up on drop.
pub struct DiskRoot {
    pub config: StoreConfig,
    _temp_dir: TempDir,
}

impl DiskRoot {
    pub fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        Self {
            config: StoreConfig::on_disk(temp_dir.path()),
            _temp_dir: temp_dir,
        }
    }

    pub fn db_path(&self) -> std::path::PathBuf {
        match self.config.metadata_config() {
            roster_core::config::MetadataConfig::Sqlite { path, .. } => path,
            roster_core::config::MetadataConfig::Memory => unreachable!("disk root"),
        }
    }

    pub fn open_store(&self) -> Arc<SqliteStore> {
        Arc::new(SqliteStore::new(self.db_path(), None))
    }

    pub fn open_cache(&self) -> Arc<FilesystemBackend> {
        Arc::new(FilesystemBackend::new(
            self.config.blob_cache_path().expect("disk root"),
        ))
    }

    pub fn start(&self, options: CoordinatorOptions) -> TestStorage {
        let options = CoordinatorOptions {
            old_blob_cache_path: self.config.old_blob_cache_path(),
            ..options
        };
        TestStorage::with_parts(self.open_store(), self.open_cache(), options)
    }
}
