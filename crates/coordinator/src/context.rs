//! Live registrations and versions owned by the embedder.
//!
//! The registry is an arena addressed by id. The coordinator consults it so
//! that lookups hand out the same live state the embedder is mutating, and
//! so that purges of a replaced version wait until that version is gone.
//! Nothing is refcounted: a version is evictable once no registration
//! references it, and eviction is explicit.

use crate::script_cache::ScriptCacheMap;
use parking_lot::Mutex;
use roster_core::{
    Origin, RegistrationId, RegistrationInfo, ResourceId, VersionId, VersionInfo, VersionStatus,
};
use roster_metadata::StoredRegistration;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use time::OffsetDateTime;
use url::Url;

/// In-memory state of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRegistration {
    pub id: RegistrationId,
    pub scope: Url,
    pub last_update_check: OffsetDateTime,
    pub resources_total_size_bytes: u64,
    pub active_version: Option<VersionId>,
    pub waiting_version: Option<VersionId>,
    pub installing_version: Option<VersionId>,
    /// Deleted from the store, or about to be.
    pub is_deleted: bool,
    pub is_uninstalling: bool,
}

impl LiveRegistration {
    pub fn new(id: RegistrationId, scope: Url) -> Self {
        Self {
            id,
            scope,
            last_update_check: OffsetDateTime::UNIX_EPOCH,
            resources_total_size_bytes: 0,
            active_version: None,
            waiting_version: None,
            installing_version: None,
            is_deleted: false,
            is_uninstalling: false,
        }
    }

    pub fn origin(&self) -> roster_core::Result<Origin> {
        Origin::of(&self.scope)
    }

    pub fn references(&self, version_id: VersionId) -> bool {
        [
            self.active_version,
            self.waiting_version,
            self.installing_version,
        ]
        .contains(&Some(version_id))
    }
}

/// In-memory state of a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveVersion {
    pub id: VersionId,
    pub registration_id: RegistrationId,
    pub script_url: Url,
    pub status: VersionStatus,
    pub has_fetch_handler: bool,
    pub script_cache_map: ScriptCacheMap,
}

impl LiveVersion {
    pub fn new(id: VersionId, registration_id: RegistrationId, script_url: Url) -> Self {
        Self {
            id,
            registration_id,
            script_cache_map: ScriptCacheMap::new(script_url.clone()),
            script_url,
            status: VersionStatus::New,
            has_fetch_handler: false,
        }
    }

    pub fn info(&self) -> VersionInfo {
        VersionInfo {
            version_id: self.id,
            script_url: self.script_url.clone(),
            status: self.status,
        }
    }
}

#[derive(Default)]
struct Arena {
    registrations: HashMap<RegistrationId, LiveRegistration>,
    versions: HashMap<VersionId, LiveVersion>,
}

impl Arena {
    fn version_info(&self, id: Option<VersionId>) -> Option<VersionInfo> {
        id.and_then(|id| self.versions.get(&id)).map(LiveVersion::info)
    }

    fn is_referenced(&self, version_id: VersionId) -> bool {
        self.registrations
            .values()
            .any(|r| r.references(version_id))
    }
}

/// Shared arena of live objects. Cloning shares the arena.
#[derive(Clone, Default)]
pub struct LiveRegistry {
    inner: Arc<Mutex<Arena>>,
}

impl LiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_registration(&self, registration: LiveRegistration) {
        self.inner
            .lock()
            .registrations
            .insert(registration.id, registration);
    }

    pub fn insert_version(&self, version: LiveVersion) {
        self.inner.lock().versions.insert(version.id, version);
    }

    /// Snapshot of a live registration.
    pub fn registration(&self, id: RegistrationId) -> Option<LiveRegistration> {
        self.inner.lock().registrations.get(&id).cloned()
    }

    /// Snapshot of a live version.
    pub fn version(&self, id: VersionId) -> Option<LiveVersion> {
        self.inner.lock().versions.get(&id).cloned()
    }

    pub fn has_registration(&self, id: RegistrationId) -> bool {
        self.inner.lock().registrations.contains_key(&id)
    }

    pub fn has_version(&self, id: VersionId) -> bool {
        self.inner.lock().versions.contains_key(&id)
    }

    pub fn with_registration_mut<R>(
        &self,
        id: RegistrationId,
        f: impl FnOnce(&mut LiveRegistration) -> R,
    ) -> Option<R> {
        self.inner.lock().registrations.get_mut(&id).map(f)
    }

    pub fn with_version_mut<R>(
        &self,
        id: VersionId,
        f: impl FnOnce(&mut LiveVersion) -> R,
    ) -> Option<R> {
        self.inner.lock().versions.get_mut(&id).map(f)
    }

    /// The live registration for a stored record, created on first sight.
    ///
    /// An existing live registration wins over the stored record. A new one
    /// reuses a live version with the stored version id when there is one.
    pub fn get_or_create_registration(
        &self,
        stored: &StoredRegistration,
        is_deleted: bool,
    ) -> LiveRegistration {
        let data = &stored.data;
        let mut arena = self.inner.lock();
        if let Some(existing) = arena.registrations.get(&data.registration_id) {
            return existing.clone();
        }

        let status = match arena.versions.get(&data.version_id) {
            Some(version) => version.status,
            None => {
                let mut version =
                    LiveVersion::new(data.version_id, data.registration_id, data.script.clone());
                version.status = if data.is_active {
                    VersionStatus::Activated
                } else {
                    VersionStatus::Installed
                };
                version.has_fetch_handler = data.has_fetch_handler;
                version.script_cache_map.set_resources(&stored.resources);
                let status = version.status;
                arena.versions.insert(version.id, version);
                status
            }
        };

        let mut registration = LiveRegistration::new(data.registration_id, data.scope.clone());
        registration.last_update_check = data.last_update_check;
        registration.resources_total_size_bytes = data.resources_total_size_bytes;
        registration.is_deleted = is_deleted;
        if status == VersionStatus::Activated {
            registration.active_version = Some(data.version_id);
        } else {
            registration.waiting_version = Some(data.version_id);
        }
        arena
            .registrations
            .insert(registration.id, registration.clone());
        registration
    }

    pub fn registration_info(&self, id: RegistrationId) -> Option<RegistrationInfo> {
        let arena = self.inner.lock();
        let registration = arena.registrations.get(&id)?;
        Some(RegistrationInfo {
            registration_id: registration.id,
            scope: registration.scope.clone(),
            active_version: arena.version_info(registration.active_version),
            waiting_version: arena.version_info(registration.waiting_version),
            installing_version: arena.version_info(registration.installing_version),
            stored_version_size_bytes: registration.resources_total_size_bytes,
            is_deleted: registration.is_deleted,
        })
    }

    pub fn version_info(&self, id: VersionId) -> Option<VersionInfo> {
        self.inner.lock().version_info(Some(id))
    }

    pub fn is_referenced(&self, version_id: VersionId) -> bool {
        self.inner.lock().is_referenced(version_id)
    }

    /// Mark a version redundant.
    ///
    /// When no registration references it any more the version is evicted and
    /// the resources only it used are returned for purging.
    pub(crate) fn doom_version(&self, version_id: VersionId) -> Vec<ResourceId> {
        let mut arena = self.inner.lock();
        let Some(version) = arena.versions.get_mut(&version_id) else {
            return Vec::new();
        };
        version.status = VersionStatus::Redundant;
        if arena.is_referenced(version_id) {
            return Vec::new();
        }

        let Some(version) = arena.versions.remove(&version_id) else {
            return Vec::new();
        };
        let still_used: BTreeSet<ResourceId> = arena
            .versions
            .values()
            .flat_map(|v| v.script_cache_map.resource_ids())
            .collect();
        version
            .script_cache_map
            .resource_ids()
            .into_iter()
            .filter(|id| !still_used.contains(id))
            .collect()
    }

    pub fn evict_registration(&self, id: RegistrationId) -> Option<LiveRegistration> {
        self.inner.lock().registrations.remove(&id)
    }

    /// Evict a version. Refused while a registration still references it.
    pub fn evict_version(&self, id: VersionId) -> Option<LiveVersion> {
        let mut arena = self.inner.lock();
        if arena.is_referenced(id) {
            return None;
        }
        arena.versions.remove(&id)
    }

    pub fn registration_count(&self) -> usize {
        self.inner.lock().registrations.len()
    }

    pub fn version_count(&self) -> usize {
        self.inner.lock().versions.len()
    }

    pub(crate) fn clear(&self) {
        *self.inner.lock() = Arena::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_core::{RegistrationData, ResourceRecord};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn stored(is_active: bool) -> StoredRegistration {
        let mut data = RegistrationData::new(
            RegistrationId::new(1),
            url("https://a.test/scope/"),
            url("https://a.test/scope/sw.js"),
            VersionId::new(10),
        );
        data.is_active = is_active;
        data.resources_total_size_bytes = 5;
        StoredRegistration {
            data,
            resources: vec![ResourceRecord::new(
                ResourceId::new(100),
                url("https://a.test/scope/sw.js"),
                5,
            )],
        }
    }

    #[test]
    fn get_or_create_builds_version_from_record() {
        let live = LiveRegistry::new();
        let registration = live.get_or_create_registration(&stored(true), false);

        assert_eq!(registration.active_version, Some(VersionId::new(10)));
        assert_eq!(registration.waiting_version, None);
        let version = live.version(VersionId::new(10)).unwrap();
        assert_eq!(version.status, VersionStatus::Activated);
        assert_eq!(version.script_cache_map.resource_ids(), vec![ResourceId::new(100)]);

        let info = live.registration_info(RegistrationId::new(1)).unwrap();
        assert_eq!(info.stored_version_size_bytes, 5);
        assert_eq!(info.active_version.unwrap().status, VersionStatus::Activated);
    }

    #[test]
    fn get_or_create_reuses_live_registration() {
        let live = LiveRegistry::new();
        live.get_or_create_registration(&stored(false), false);
        live.with_registration_mut(RegistrationId::new(1), |r| r.resources_total_size_bytes = 99);

        let again = live.get_or_create_registration(&stored(true), true);
        assert_eq!(again.resources_total_size_bytes, 99);
        assert_eq!(again.waiting_version, Some(VersionId::new(10)));
        assert!(!again.is_deleted);
    }

    #[test]
    fn doom_waits_until_unreferenced() {
        let live = LiveRegistry::new();
        live.get_or_create_registration(&stored(true), false);

        assert!(live.doom_version(VersionId::new(10)).is_empty());
        assert_eq!(
            live.version(VersionId::new(10)).unwrap().status,
            VersionStatus::Redundant
        );
        assert!(live.evict_version(VersionId::new(10)).is_none());

        live.with_registration_mut(RegistrationId::new(1), |r| r.active_version = None);
        assert_eq!(
            live.doom_version(VersionId::new(10)),
            vec![ResourceId::new(100)]
        );
        assert!(!live.has_version(VersionId::new(10)));
    }

    #[test]
    fn doom_keeps_resources_shared_with_other_versions() {
        let live = LiveRegistry::new();
        let script = url("https://a.test/sw.js");
        let mut old = LiveVersion::new(VersionId::new(1), RegistrationId::new(1), script.clone());
        old.script_cache_map.set_resources(&[
            ResourceRecord::new(ResourceId::new(7), script.clone(), 1),
            ResourceRecord::new(ResourceId::new(8), url("https://a.test/lib.js"), 1),
        ]);
        let mut new = LiveVersion::new(VersionId::new(2), RegistrationId::new(1), script.clone());
        new.script_cache_map.set_resources(&[ResourceRecord::new(
            ResourceId::new(8),
            url("https://a.test/lib.js"),
            1,
        )]);
        live.insert_version(old);
        live.insert_version(new);

        assert_eq!(live.doom_version(VersionId::new(1)), vec![ResourceId::new(7)]);
        assert_eq!(live.version_count(), 1);
    }
}
