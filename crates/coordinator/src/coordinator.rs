//! Caller-facing handle to the storage actor.

use crate::actor::{self, CoordinatorCore, CoreParts};
use crate::context::{LiveRegistration, LiveRegistry};
use crate::error::{StatusResult, StorageStatusError};
use crate::events::{DEFAULT_EVENT_CAPACITY, StorageEvent};
use crate::quota::{QuotaObserver, SessionPolicy};
use crate::request::{Message, Reply, Request};
use roster_core::config::StoreConfig;
use roster_core::{Origin, RegistrationId, RegistrationInfo, ResourceId, VersionId};
use roster_metadata::MetadataStore;
use roster_storage::{BlobCache, ResourceReader, ResourceWriter, StorageError, StorageResult};
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, oneshot};
use url::Url;

/// Optional collaborators of a coordinator.
pub struct CoordinatorOptions {
    /// Registry shared with the embedder.
    pub live: LiveRegistry,
    pub quota: Option<Arc<dyn QuotaObserver>>,
    pub session_policy: Option<Arc<dyn SessionPolicy>>,
    /// Directory of the previous cache layout, migrated on first use.
    pub old_blob_cache_path: Option<PathBuf>,
    pub event_capacity: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            live: LiveRegistry::new(),
            quota: None,
            session_policy: None,
            old_blob_cache_path: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Handle to a running storage coordinator. Clones share the actor.
///
/// Every method that touches the metadata store is answered by the actor
/// after the store has been lazily initialized. Fire-and-forget methods
/// return immediately; their failures surface through recovery and events.
#[derive(Clone)]
pub struct StorageCoordinator {
    mailbox: mpsc::UnboundedSender<Message>,
    blob_cache: Arc<dyn BlobCache>,
    live: LiveRegistry,
    events: broadcast::Sender<StorageEvent>,
}

impl StorageCoordinator {
    /// Start the actor on the current tokio runtime.
    pub fn spawn(
        store: Arc<dyn MetadataStore>,
        blob_cache: Arc<dyn BlobCache>,
        options: CoordinatorOptions,
    ) -> Self {
        let (mailbox, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let core = CoordinatorCore::new(
            CoreParts {
                store,
                blob_cache: blob_cache.clone(),
                live: options.live.clone(),
                events: events.clone(),
                quota: options.quota,
                session_policy: options.session_policy,
                old_blob_cache_path: options.old_blob_cache_path,
            },
            mailbox.downgrade(),
        );
        tokio::spawn(actor::run(core, rx));

        Self {
            mailbox,
            blob_cache,
            live: options.live,
            events,
        }
    }

    /// Build the store and blob cache described by `config` and start the actor.
    pub fn from_config(config: &StoreConfig, options: CoordinatorOptions) -> StorageResult<Self> {
        config.validate().map_err(StorageError::Config)?;
        let store = roster_metadata::from_config(&config.metadata_config());
        let blob_cache = roster_storage::from_config(&config.blob_cache_config())?;
        let options = CoordinatorOptions {
            old_blob_cache_path: options
                .old_blob_cache_path
                .or_else(|| config.old_blob_cache_path()),
            ..options
        };
        Ok(Self::spawn(store, blob_cache, options))
    }

    fn send(&self, request: Request) {
        if self.mailbox.send(Message::Request(request)).is_err() {
            tracing::debug!("Storage coordinator stopped; dropping request");
        }
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> StatusResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply));
        rx.await.unwrap_or(Err(StorageStatusError::Failed))
    }

    async fn ask<T: Default>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> T {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply));
        rx.await.unwrap_or_default()
    }

    pub fn live(&self) -> &LiveRegistry {
        &self.live
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    /// Registration whose scope is the longest match for `document_url`.
    pub async fn find_registration_for_document(
        &self,
        document_url: &Url,
    ) -> StatusResult<LiveRegistration> {
        let document_url = document_url.clone();
        self.call(|reply| Request::FindForDocument {
            document_url,
            reply,
        })
        .await
    }

    /// Registration with exactly this scope.
    pub async fn find_registration_for_pattern(
        &self,
        scope: &Url,
    ) -> StatusResult<LiveRegistration> {
        let scope = scope.clone();
        self.call(|reply| Request::FindForPattern { scope, reply })
            .await
    }

    pub async fn find_registration_for_id(
        &self,
        registration_id: RegistrationId,
        origin: &Origin,
    ) -> StatusResult<LiveRegistration> {
        let origin = origin.clone();
        self.call(|reply| Request::FindForId {
            registration_id,
            origin,
            reply,
        })
        .await
    }

    /// Like [`find_registration_for_id`](Self::find_registration_for_id) when
    /// the origin is unknown.
    pub async fn find_registration_for_id_only(
        &self,
        registration_id: RegistrationId,
    ) -> StatusResult<LiveRegistration> {
        self.call(|reply| Request::FindForIdOnly {
            registration_id,
            reply,
        })
        .await
    }

    /// Stored registrations of `origin` plus the installing ones.
    pub async fn get_registrations_for_origin(
        &self,
        origin: &Origin,
    ) -> StatusResult<Vec<LiveRegistration>> {
        let origin = origin.clone();
        self.call(|reply| Request::GetRegistrationsForOrigin { origin, reply })
            .await
    }

    pub async fn get_all_registrations_infos(&self) -> StatusResult<Vec<RegistrationInfo>> {
        self.call(|reply| Request::GetAllRegistrationsInfos { reply })
            .await
    }

    /// Persist a live registration with `version_id` as its stored version.
    ///
    /// The version's script cache map must not be empty.
    pub async fn store_registration(
        &self,
        registration_id: RegistrationId,
        version_id: VersionId,
    ) -> StatusResult<()> {
        self.call(|reply| Request::StoreRegistration {
            registration_id,
            version_id,
            reply,
        })
        .await
    }

    pub async fn update_to_active_state(
        &self,
        registration_id: RegistrationId,
        origin: &Origin,
    ) -> StatusResult<()> {
        let origin = origin.clone();
        self.call(|reply| Request::UpdateToActiveState {
            registration_id,
            origin,
            reply,
        })
        .await
    }

    pub async fn update_last_update_check_time(
        &self,
        registration_id: RegistrationId,
        origin: &Origin,
        time: OffsetDateTime,
    ) -> StatusResult<()> {
        let origin = origin.clone();
        self.call(|reply| Request::UpdateLastUpdateCheckTime {
            registration_id,
            origin,
            time,
            reply,
        })
        .await
    }

    /// Delete a registration. It reads as deleted from the moment this is called.
    pub async fn delete_registration(
        &self,
        registration_id: RegistrationId,
        origin: &Origin,
    ) -> StatusResult<()> {
        let origin = origin.clone();
        self.call(|reply| Request::DeleteRegistration {
            registration_id,
            origin,
            reply,
        })
        .await
    }

    pub fn create_resource_reader(&self, resource_id: ResourceId) -> ResourceReader {
        ResourceReader::new(self.blob_cache.clone(), resource_id)
    }

    /// A writer for `resource_id`, returned once the id is recorded as uncommitted.
    pub async fn create_resource_writer(
        &self,
        resource_id: ResourceId,
    ) -> StatusResult<ResourceWriter> {
        self.call(|reply| Request::CreateResourceWriter { resource_id, reply })
            .await
    }

    pub fn store_uncommitted_resource_id(&self, resource_id: ResourceId) {
        self.send(Request::StoreUncommittedResourceId { resource_id });
    }

    pub fn doom_uncommitted_resource(&self, resource_id: ResourceId) {
        self.doom_uncommitted_resources(vec![resource_id]);
    }

    /// Move ids from uncommitted to purgeable and start purging them.
    pub fn doom_uncommitted_resources(&self, resource_ids: Vec<ResourceId>) {
        self.send(Request::DoomUncommittedResources { resource_ids });
    }

    /// Purge resources already recorded as purgeable.
    pub fn purge_resources(&self, resource_ids: Vec<ResourceId>) {
        if !resource_ids.is_empty() {
            self.send(Request::PurgeResources { resource_ids });
        }
    }

    /// Mark a live version redundant; purge what only it used once nothing references it.
    pub fn doom_version(&self, version_id: VersionId) {
        let resource_ids = self.live.doom_version(version_id);
        tracing::debug!(%version_id, purging = resource_ids.len(), "Version doomed");
        self.purge_resources(resource_ids);
    }

    pub async fn store_user_data(
        &self,
        registration_id: RegistrationId,
        origin: &Origin,
        key: &str,
        value: &[u8],
    ) -> StatusResult<()> {
        let origin = origin.clone();
        let key = key.to_string();
        let value = value.to_vec();
        self.call(|reply| Request::StoreUserData {
            registration_id,
            origin,
            key,
            value,
            reply,
        })
        .await
    }

    pub async fn get_user_data(
        &self,
        registration_id: RegistrationId,
        key: &str,
    ) -> StatusResult<Vec<u8>> {
        let key = key.to_string();
        self.call(|reply| Request::GetUserData {
            registration_id,
            key,
            reply,
        })
        .await
    }

    pub async fn clear_user_data(
        &self,
        registration_id: RegistrationId,
        key: &str,
    ) -> StatusResult<()> {
        let key = key.to_string();
        self.call(|reply| Request::ClearUserData {
            registration_id,
            key,
            reply,
        })
        .await
    }

    pub async fn get_user_data_for_all_registrations(
        &self,
        key: &str,
    ) -> StatusResult<Vec<(RegistrationId, Vec<u8>)>> {
        let key = key.to_string();
        self.call(|reply| Request::GetUserDataForAllRegistrations { key, reply })
            .await
    }

    pub async fn new_registration_id(&self) -> StatusResult<RegistrationId> {
        self.call(|reply| Request::NewRegistrationId { reply }).await
    }

    pub async fn new_version_id(&self) -> StatusResult<VersionId> {
        self.call(|reply| Request::NewVersionId { reply }).await
    }

    pub async fn new_resource_id(&self) -> StatusResult<ResourceId> {
        self.call(|reply| Request::NewResourceId { reply }).await
    }

    pub fn notify_installing_registration(&self, registration_id: RegistrationId) {
        self.send(Request::NotifyInstalling { registration_id });
    }

    /// On failure the version's resources are doomed.
    pub fn notify_done_installing_registration(
        &self,
        registration_id: RegistrationId,
        version_id: Option<VersionId>,
        success: bool,
    ) {
        self.send(Request::NotifyDoneInstalling {
            registration_id,
            version_id,
            success,
        });
    }

    pub fn notify_uninstalling_registration(&self, registration_id: RegistrationId) {
        self.send(Request::NotifyUninstalling { registration_id });
    }

    pub fn notify_done_uninstalling_registration(&self, registration_id: RegistrationId) {
        self.send(Request::NotifyDoneUninstalling { registration_id });
    }

    pub async fn get_uninstalling_registration(&self, scope: &Url) -> Option<LiveRegistration> {
        let scope = scope.clone();
        let (reply, rx) = oneshot::channel();
        self.send(Request::GetUninstallingRegistration { scope, reply });
        rx.await.ok().flatten()
    }

    pub async fn is_disabled(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Request::IsDisabled { reply });
        rx.await.unwrap_or(true)
    }

    /// Throw away all stored data and start over empty.
    pub fn schedule_delete_and_start_over(&self) {
        self.send(Request::ScheduleDeleteAndStartOver);
    }

    /// Wait until every metadata job posted so far has finished.
    pub async fn flush(&self) {
        self.ask(|reply| Request::Flush { reply }).await
    }

    /// Delete session-only origins and stop the background tasks.
    pub async fn shutdown(&self) {
        self.ask(|reply| Request::Shutdown { reply }).await
    }
}
