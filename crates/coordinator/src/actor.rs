//! The storage actor.
//!
//! One task owns every in-memory index: the origin index, id counters, the
//! installing and uninstalling sets, pending deletions and the purge queue.
//! Metadata work is posted to the [`DatabaseSequence`] and its result comes
//! back to this task as a [`Completion`]; blob cache work runs on spawned
//! tasks and reports back the same way.

use crate::context::{LiveRegistration, LiveRegistry};
use crate::error::{StatusResult, StorageStatusError};
use crate::events::StorageEvent;
use crate::lifecycle::{self, ResourceLifecycle};
use crate::quota::{QuotaObserver, SessionPolicy};
use crate::request::{Completion, Message, Reply, Request};
use crate::sequence::{DatabaseSequence, DbJob};
use futures::FutureExt;
use roster_core::{
    LongestScopeMatcher, Origin, RegistrationData, RegistrationId, RegistrationInfo, ResourceId,
    VersionId, VersionInfo, VersionStatus, total_size,
};
use roster_metadata::repos::{MetaRepo, RegistrationRepo, ResourceIdRepo, UserDataRepo};
use roster_metadata::{MetadataError, MetadataResult, MetadataStore, NextIds, StoredRegistration};
use roster_storage::{BlobCache, ResourceWriter, migration};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, oneshot};
use url::Url;

/// Lifecycle of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Uninitialized,
    Initializing,
    Initialized,
    /// Recovery is under way or failed. Operations fail fast.
    Disabled,
}

/// Everything the actor needs from its creator.
pub(crate) struct CoreParts {
    pub store: Arc<dyn MetadataStore>,
    pub blob_cache: Arc<dyn BlobCache>,
    pub live: LiveRegistry,
    pub events: broadcast::Sender<StorageEvent>,
    pub quota: Option<Arc<dyn QuotaObserver>>,
    pub session_policy: Option<Arc<dyn SessionPolicy>>,
    pub old_blob_cache_path: Option<PathBuf>,
}

struct InitialData {
    next_ids: NextIds,
    migration_needed: bool,
    old_cache_deletion_needed: bool,
    origins: BTreeSet<Origin>,
}

async fn read_initial_data(store: &dyn MetadataStore) -> MetadataResult<InitialData> {
    let next_ids = store.get_next_available_ids().await?;
    let migration_needed = store.is_blob_cache_migration_needed().await?;
    let old_cache_deletion_needed = store.is_old_blob_cache_deletion_needed().await?;
    let origins = store.get_origins_with_registrations().await?;
    Ok(InitialData {
        next_ids,
        migration_needed,
        old_cache_deletion_needed,
        origins,
    })
}

/// Id of the registration whose scope is the longest match for `url`.
fn longest_match(url: &Url, candidates: &[StoredRegistration]) -> Option<RegistrationId> {
    let mut matcher = LongestScopeMatcher::new(url);
    let mut best = None;
    for candidate in candidates {
        if matcher.match_longest(&candidate.data.scope) {
            best = Some(candidate.data.registration_id);
        }
    }
    best
}

/// A registration deleted in memory is past the point of no return: lookups miss it.
fn complete_find(found: StatusResult<LiveRegistration>) -> StatusResult<LiveRegistration> {
    match found {
        Ok(registration) if registration.is_deleted => Err(StorageStatusError::NotFound),
        other => other,
    }
}

fn deliver(mailbox: &mpsc::WeakUnboundedSender<Message>, message: Message) {
    if let Some(tx) = mailbox.upgrade() {
        let _ = tx.send(message);
    }
}

pub(crate) struct CoordinatorCore {
    state: CoordinatorState,
    store: Arc<dyn MetadataStore>,
    blob_cache: Arc<dyn BlobCache>,
    db: DatabaseSequence,
    mailbox: mpsc::WeakUnboundedSender<Message>,
    live: LiveRegistry,
    events: broadcast::Sender<StorageEvent>,
    quota: Option<Arc<dyn QuotaObserver>>,
    session_policy: Option<Arc<dyn SessionPolicy>>,
    old_blob_cache_path: Option<PathBuf>,
    next_ids: NextIds,
    registered_origins: BTreeSet<Origin>,
    pending: Vec<Request>,
    installing: BTreeSet<RegistrationId>,
    uninstalling: BTreeSet<RegistrationId>,
    pending_deletions: HashSet<RegistrationId>,
    lifecycle: ResourceLifecycle,
    stopping: Option<oneshot::Sender<()>>,
}

/// Run the actor until shutdown or until every handle is gone.
pub(crate) async fn run(mut core: CoordinatorCore, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Request(request) => core.dispatch(request),
            Message::Completion(completion) => completion(&mut core),
            Message::Purged {
                resource_id,
                result,
            } => core.on_purged(resource_id, result),
        }
        if core.stopping.is_some() {
            break;
        }
    }

    for request in std::mem::take(&mut core.pending) {
        request.fail();
    }
    let CoordinatorCore { db, stopping, .. } = core;
    db.close().await;
    tracing::debug!("Storage coordinator stopped");
    if let Some(reply) = stopping {
        let _ = reply.send(());
    }
}

impl CoordinatorCore {
    pub fn new(parts: CoreParts, mailbox: mpsc::WeakUnboundedSender<Message>) -> Self {
        Self {
            state: CoordinatorState::Uninitialized,
            store: parts.store,
            blob_cache: parts.blob_cache,
            db: DatabaseSequence::spawn(),
            mailbox,
            live: parts.live,
            events: parts.events,
            quota: parts.quota,
            session_policy: parts.session_policy,
            old_blob_cache_path: parts.old_blob_cache_path,
            next_ids: NextIds::default(),
            registered_origins: BTreeSet::new(),
            pending: Vec::new(),
            installing: BTreeSet::new(),
            uninstalling: BTreeSet::new(),
            pending_deletions: HashSet::new(),
            lifecycle: ResourceLifecycle::default(),
            stopping: None,
        }
    }

    /// Run `work` on the database sequence and hand its output to `done`
    /// back on the actor.
    fn post<T, W, Fut, D>(&self, work: W, done: D)
    where
        W: FnOnce(Arc<dyn MetadataStore>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        D: FnOnce(&mut CoordinatorCore, T) + Send + 'static,
    {
        let store = self.store.clone();
        let mailbox = self.mailbox.clone();
        let job: DbJob = async move {
            let output = work(store).await;
            let completion: Completion =
                Box::new(move |core: &mut CoordinatorCore| done(core, output));
            deliver(&mailbox, Message::Completion(completion));
        }
        .boxed();
        if !self.db.post(job) {
            tracing::warn!("Database sequence stopped; dropping job");
        }
    }

    /// Run blob cache work off the database sequence.
    fn spawn_blob<T, Fut, D>(&self, work: Fut, done: D)
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        D: FnOnce(&mut CoordinatorCore, T) + Send + 'static,
    {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let output = work.await;
            let completion: Completion =
                Box::new(move |core: &mut CoordinatorCore| done(core, output));
            deliver(&mailbox, Message::Completion(completion));
        });
    }

    fn emit(&self, event: StorageEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn report_size_change(&self, origin: &Origin, delta: i64) {
        if let Some(quota) = &self.quota {
            quota.notify_storage_modified(origin, delta);
        }
    }

    /// Map a store error to a caller status. Anything but `NotFound` starts recovery.
    fn escalate(&mut self, op: &'static str, err: MetadataError) -> StorageStatusError {
        if err.is_not_found() {
            return StorageStatusError::NotFound;
        }
        self.escalate_any(op, err)
    }

    /// Like [`escalate`](Self::escalate) for operations where absence is also a failure.
    fn escalate_any(&mut self, op: &'static str, err: MetadataError) -> StorageStatusError {
        tracing::error!(op, error = %err, "Metadata operation failed");
        self.schedule_delete_and_start_over();
        StorageStatusError::Failed
    }

    fn get_or_create_registration(&self, stored: &StoredRegistration) -> LiveRegistration {
        let id = stored.data.registration_id;
        self.live
            .get_or_create_registration(stored, self.pending_deletions.contains(&id))
    }

    fn dispatch(&mut self, request: Request) {
        if !request.requires_initialization() {
            return self.handle(request);
        }
        match self.state {
            CoordinatorState::Initialized => self.handle(request),
            CoordinatorState::Disabled => {
                tracing::debug!(op = request.name(), "Storage disabled; failing request");
                request.fail();
            }
            CoordinatorState::Initializing => self.pending.push(request),
            CoordinatorState::Uninitialized => {
                self.pending.push(request);
                self.start_initialization();
            }
        }
    }

    fn start_initialization(&mut self) {
        self.state = CoordinatorState::Initializing;
        self.post(
            |store| async move { read_initial_data(&*store).await },
            |core, result| core.did_read_initial_data(result),
        );
    }

    fn did_read_initial_data(&mut self, result: MetadataResult<InitialData>) {
        if self.state != CoordinatorState::Initializing {
            return;
        }
        let data = match result {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read initial data");
                self.schedule_delete_and_start_over();
                return;
            }
        };

        self.next_ids = data.next_ids;
        self.registered_origins = data.origins;
        if data.migration_needed
            && let Some(old_dir) = self.old_blob_cache_path.clone()
        {
            self.migrate_blob_cache(old_dir);
            return;
        }
        self.finish_initialization(data.old_cache_deletion_needed);
    }

    fn migrate_blob_cache(&mut self, old_dir: PathBuf) {
        let cache = self.blob_cache.clone();
        let source = old_dir.clone();
        self.spawn_blob(
            async move { migration::migrate_old_cache(&source, &*cache).await },
            move |core, result| match result {
                Ok(_) => core.post(
                    |store| async move { store.set_blob_cache_migration_not_needed().await },
                    move |core, result| match result {
                        Ok(()) => core.finish_initialization(true),
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to record blob cache migration");
                            core.migration_failed(old_dir);
                        }
                    },
                ),
                Err(e) => {
                    tracing::error!(error = %e, "Blob cache migration failed");
                    core.migration_failed(old_dir);
                }
            },
        );
    }

    fn migration_failed(&mut self, old_dir: PathBuf) {
        self.schedule_delete_and_start_over();
        self.spawn_blob(
            async move { migration::delete_old_cache(&old_dir).await },
            |_, result| {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to delete old blob cache");
                }
            },
        );
    }

    fn finish_initialization(&mut self, delete_old_cache: bool) {
        self.state = CoordinatorState::Initialized;
        tracing::info!(
            origins = self.registered_origins.len(),
            next_registration_id = %self.next_ids.registration_id,
            "Storage initialized"
        );

        let cache = self.blob_cache.clone();
        self.spawn_blob(async move { cache.init().await }, |core, result| {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to initialize blob cache");
                core.schedule_delete_and_start_over();
            }
        });

        if delete_old_cache && let Some(old_dir) = self.old_blob_cache_path.clone() {
            self.delete_old_blob_cache(old_dir);
        }

        for request in std::mem::take(&mut self.pending) {
            self.dispatch(request);
        }
    }

    fn delete_old_blob_cache(&self, old_dir: PathBuf) {
        self.spawn_blob(
            async move { migration::delete_old_cache(&old_dir).await },
            |core, result| match result {
                Ok(()) => core.post(
                    |store| async move { store.set_old_blob_cache_deletion_not_needed().await },
                    |_, result| {
                        if let Err(e) = result {
                            tracing::warn!(error = %e, "Failed to record old blob cache deletion");
                        }
                    },
                ),
                Err(e) => tracing::warn!(error = %e, "Failed to delete old blob cache"),
            },
        );
    }

    fn schedule_delete_and_start_over(&mut self) {
        if self.state == CoordinatorState::Disabled {
            return;
        }
        tracing::warn!("Scheduling delete and start over");
        self.state = CoordinatorState::Disabled;
        self.blob_cache.disable();
        self.emit(StorageEvent::DeleteAndStartOverScheduled);
        for request in std::mem::take(&mut self.pending) {
            request.fail();
        }

        self.post(
            |store| async move { store.destroy_database().await },
            |core, result| match result {
                Ok(()) => {
                    let cache = core.blob_cache.clone();
                    core.spawn_blob(async move { cache.destroy().await }, |core, result| {
                        match result {
                            Ok(()) => core.reset(),
                            Err(e) => core.reset_failed(format!("blob cache: {e}")),
                        }
                    });
                }
                Err(e) => core.reset_failed(format!("metadata store: {e}")),
            },
        );
    }

    fn reset(&mut self) {
        self.state = CoordinatorState::Uninitialized;
        self.next_ids = NextIds::default();
        self.registered_origins.clear();
        self.installing.clear();
        self.uninstalling.clear();
        self.pending_deletions.clear();
        self.lifecycle.reset();
        self.live.clear();
        tracing::info!("Storage deleted; starting over");
        self.emit(StorageEvent::StorageReset);
    }

    fn reset_failed(&mut self, reason: String) {
        tracing::error!(%reason, "Delete and start over failed");
        self.emit(StorageEvent::ResetFailed { reason });
    }

    fn ensure_stale_check(&mut self) {
        if !self.lifecycle.begin_stale_check() {
            return;
        }
        self.post(
            |store| async move { lifecycle::collect_stale_resources(&*store).await },
            |core, result| match result {
                Ok(ids) => {
                    if !ids.is_empty() {
                        tracing::info!(count = ids.len(), "Purging stale resources");
                    }
                    core.emit(StorageEvent::StaleResourcesCollected { count: ids.len() });
                    core.start_purging(ids);
                }
                Err(e) => {
                    core.escalate_any("collect_stale_resources", e);
                }
            },
        );
    }

    fn start_purging(&mut self, ids: Vec<ResourceId>) {
        self.lifecycle.mark_purgeable(ids);
        self.continue_purging();
    }

    fn continue_purging(&mut self) {
        if self.state == CoordinatorState::Disabled {
            return;
        }
        let Some(resource_id) = self.lifecycle.next_purge() else {
            return;
        };
        let cache = self.blob_cache.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = cache.doom(resource_id).await;
            deliver(
                &mailbox,
                Message::Purged {
                    resource_id,
                    result,
                },
            );
        });
    }

    fn on_purged(&mut self, resource_id: ResourceId, result: roster_storage::StorageResult<()>) {
        if !self.lifecycle.finish_purge(resource_id) {
            return;
        }
        match result {
            Ok(()) => self.post(
                move |store| async move {
                    store.clear_purgeable_resource_ids(&[resource_id]).await
                },
                move |core, result| match result {
                    Ok(()) => {
                        tracing::debug!(%resource_id, "Resource purged");
                        core.emit(StorageEvent::ResourcePurged { resource_id });
                    }
                    Err(e) => {
                        core.escalate_any("clear_purgeable_resource_ids", e);
                    }
                },
            ),
            Err(e) => {
                tracing::warn!(
                    %resource_id,
                    error = %e,
                    "Failed to doom resource; it stays purgeable"
                );
            }
        }
        self.continue_purging();
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::FindForDocument {
                document_url,
                reply,
            } => self.find_for_document(document_url, reply),
            Request::FindForPattern { scope, reply } => self.find_for_pattern(scope, reply),
            Request::FindForId {
                registration_id,
                origin,
                reply,
            } => self.find_for_id(registration_id, origin, reply),
            Request::FindForIdOnly {
                registration_id,
                reply,
            } => self.find_for_id_only(registration_id, reply),
            Request::GetRegistrationsForOrigin { origin, reply } => {
                self.get_registrations_for_origin(origin, reply)
            }
            Request::GetAllRegistrationsInfos { reply } => self.get_all_registrations_infos(reply),
            Request::StoreRegistration {
                registration_id,
                version_id,
                reply,
            } => self.store_registration(registration_id, version_id, reply),
            Request::UpdateToActiveState {
                registration_id,
                origin,
                reply,
            } => self.update_to_active_state(registration_id, origin, reply),
            Request::UpdateLastUpdateCheckTime {
                registration_id,
                origin,
                time,
                reply,
            } => self.update_last_update_check_time(registration_id, origin, time, reply),
            Request::DeleteRegistration {
                registration_id,
                origin,
                reply,
            } => self.delete_registration(registration_id, origin, reply),
            Request::CreateResourceWriter { resource_id, reply } => {
                self.create_resource_writer(resource_id, reply)
            }
            Request::StoreUncommittedResourceId { resource_id } => {
                self.store_uncommitted_resource_id(resource_id)
            }
            Request::DoomUncommittedResources { resource_ids } => {
                self.doom_uncommitted_resources(resource_ids)
            }
            Request::PurgeResources { resource_ids } => {
                self.ensure_stale_check();
                self.start_purging(resource_ids);
            }
            Request::StoreUserData {
                registration_id,
                origin,
                key,
                value,
                reply,
            } => self.store_user_data(registration_id, origin, key, value, reply),
            Request::GetUserData {
                registration_id,
                key,
                reply,
            } => self.get_user_data(registration_id, key, reply),
            Request::ClearUserData {
                registration_id,
                key,
                reply,
            } => self.clear_user_data(registration_id, key, reply),
            Request::GetUserDataForAllRegistrations { key, reply } => {
                self.get_user_data_for_all_registrations(key, reply)
            }
            Request::NewRegistrationId { reply } => {
                let id = self.next_ids.registration_id;
                self.next_ids.registration_id = RegistrationId::new(id.get() + 1);
                let _ = reply.send(Ok(id));
            }
            Request::NewVersionId { reply } => {
                let id = self.next_ids.version_id;
                self.next_ids.version_id = VersionId::new(id.get() + 1);
                let _ = reply.send(Ok(id));
            }
            Request::NewResourceId { reply } => {
                let id = self.next_ids.resource_id;
                self.next_ids.resource_id = ResourceId::new(id.get() + 1);
                let _ = reply.send(Ok(id));
            }
            Request::NotifyInstalling { registration_id } => {
                self.installing.insert(registration_id);
            }
            Request::NotifyDoneInstalling {
                registration_id,
                version_id,
                success,
            } => self.notify_done_installing(registration_id, version_id, success),
            Request::NotifyUninstalling { registration_id } => {
                self.uninstalling.insert(registration_id);
                self.live
                    .with_registration_mut(registration_id, |r| r.is_uninstalling = true);
            }
            Request::NotifyDoneUninstalling { registration_id } => {
                self.uninstalling.remove(&registration_id);
                self.live
                    .with_registration_mut(registration_id, |r| r.is_uninstalling = false);
            }
            Request::GetUninstallingRegistration { scope, reply } => {
                let found = if self.state == CoordinatorState::Initialized {
                    self.uninstalling
                        .iter()
                        .filter_map(|id| self.live.registration(*id))
                        .find(|r| r.scope == scope)
                } else {
                    None
                };
                let _ = reply.send(found);
            }
            Request::IsDisabled { reply } => {
                let _ = reply.send(self.state == CoordinatorState::Disabled);
            }
            Request::ScheduleDeleteAndStartOver => self.schedule_delete_and_start_over(),
            Request::Flush { reply } => self.post(
                |_| async {},
                move |_, ()| {
                    let _ = reply.send(());
                },
            ),
            Request::Shutdown { reply } => self.shutdown(reply),
        }
    }

    fn find_installing_for_document(&self, document_url: &Url) -> Option<LiveRegistration> {
        let mut matcher = LongestScopeMatcher::new(document_url);
        let mut best = None;
        for id in &self.installing {
            if let Some(registration) = self.live.registration(*id)
                && !registration.is_deleted
                && matcher.match_longest(&registration.scope)
            {
                best = Some(registration);
            }
        }
        best
    }

    fn find_installing_for_pattern(&self, scope: &Url) -> Option<LiveRegistration> {
        self.installing
            .iter()
            .filter_map(|id| self.live.registration(*id))
            .find(|r| !r.is_deleted && &r.scope == scope)
    }

    fn find_installing_for_id(&self, registration_id: RegistrationId) -> Option<LiveRegistration> {
        if !self.installing.contains(&registration_id) {
            return None;
        }
        self.live
            .registration(registration_id)
            .filter(|r| !r.is_deleted)
    }

    fn find_for_document(&mut self, document_url: Url, reply: Reply<LiveRegistration>) {
        let Ok(origin) = Origin::of(&document_url) else {
            let _ = reply.send(Err(StorageStatusError::Failed));
            return;
        };
        if !self.registered_origins.contains(&origin) {
            let found = self.find_installing_for_document(&document_url);
            let _ = reply.send(complete_find(found.ok_or(StorageStatusError::NotFound)));
            return;
        }

        let url = document_url.clone();
        self.post(
            move |store| async move {
                let candidates = store.get_registrations_for_origin(&origin, false).await?;
                match longest_match(&url, &candidates) {
                    Some(id) => store.read_registration(id, &origin).await.map(Some),
                    None => Ok(None),
                }
            },
            move |core, result| {
                let found = match result {
                    Ok(Some(stored)) => Ok(core.get_or_create_registration(&stored)),
                    Ok(None) => core
                        .find_installing_for_document(&document_url)
                        .ok_or(StorageStatusError::NotFound),
                    Err(e) if e.is_not_found() => core
                        .find_installing_for_document(&document_url)
                        .ok_or(StorageStatusError::NotFound),
                    Err(e) => Err(core.escalate("find_registration_for_document", e)),
                };
                let _ = reply.send(complete_find(found));
            },
        );
    }

    fn find_for_pattern(&mut self, scope: Url, reply: Reply<LiveRegistration>) {
        let Ok(origin) = Origin::of(&scope) else {
            let _ = reply.send(Err(StorageStatusError::Failed));
            return;
        };
        if !self.registered_origins.contains(&origin) {
            let found = self.find_installing_for_pattern(&scope);
            let _ = reply.send(complete_find(found.ok_or(StorageStatusError::NotFound)));
            return;
        }

        let wanted = scope.clone();
        self.post(
            move |store| async move {
                let candidates = store.get_registrations_for_origin(&origin, false).await?;
                match candidates.iter().find(|c| c.data.scope == wanted) {
                    Some(c) => store
                        .read_registration(c.data.registration_id, &origin)
                        .await
                        .map(Some),
                    None => Ok(None),
                }
            },
            move |core, result| {
                let found = match result {
                    Ok(Some(stored)) => Ok(core.get_or_create_registration(&stored)),
                    Ok(None) => core
                        .find_installing_for_pattern(&scope)
                        .ok_or(StorageStatusError::NotFound),
                    Err(e) if e.is_not_found() => core
                        .find_installing_for_pattern(&scope)
                        .ok_or(StorageStatusError::NotFound),
                    Err(e) => Err(core.escalate("find_registration_for_pattern", e)),
                };
                let _ = reply.send(complete_find(found));
            },
        );
    }

    fn find_for_id(
        &mut self,
        registration_id: RegistrationId,
        origin: Origin,
        reply: Reply<LiveRegistration>,
    ) {
        if !self.registered_origins.contains(&origin) {
            let found = self.find_installing_for_id(registration_id);
            let _ = reply.send(complete_find(found.ok_or(StorageStatusError::NotFound)));
            return;
        }
        if let Some(registration) = self.live.registration(registration_id) {
            let _ = reply.send(complete_find(Ok(registration)));
            return;
        }

        self.post(
            move |store| async move { store.read_registration(registration_id, &origin).await },
            move |core, result| {
                let found = match result {
                    Ok(stored) => Ok(core.get_or_create_registration(&stored)),
                    Err(e) => Err(core.escalate("find_registration_for_id", e)),
                };
                let _ = reply.send(complete_find(found));
            },
        );
    }

    fn find_for_id_only(
        &mut self,
        registration_id: RegistrationId,
        reply: Reply<LiveRegistration>,
    ) {
        if let Some(registration) = self.live.registration(registration_id)
            && let Ok(origin) = registration.origin()
        {
            return self.find_for_id(registration_id, origin, reply);
        }

        self.post(
            move |store| async move {
                let origin = store.read_registration_origin(registration_id).await?;
                store.read_registration(registration_id, &origin).await
            },
            move |core, result| {
                let found = match result {
                    Ok(stored) => Ok(core.get_or_create_registration(&stored)),
                    Err(e) => Err(core.escalate("find_registration_for_id_only", e)),
                };
                let _ = reply.send(complete_find(found));
            },
        );
    }

    fn get_registrations_for_origin(
        &mut self,
        origin: Origin,
        reply: Reply<Vec<LiveRegistration>>,
    ) {
        let wanted = origin.clone();
        self.post(
            move |store| async move { store.get_registrations_for_origin(&wanted, true).await },
            move |core, result| {
                let stored = match result {
                    Ok(stored) => stored,
                    Err(e) if e.is_not_found() => Vec::new(),
                    Err(e) => {
                        let status = core.escalate("get_registrations_for_origin", e);
                        let _ = reply.send(Err(status));
                        return;
                    }
                };

                let mut registrations: Vec<LiveRegistration> = stored
                    .iter()
                    .map(|s| core.get_or_create_registration(s))
                    .collect();
                for id in &core.installing {
                    if registrations.iter().any(|r| r.id == *id) {
                        continue;
                    }
                    if let Some(registration) = core.live.registration(*id)
                        && registration.origin().is_ok_and(|o| o == origin)
                    {
                        registrations.push(registration);
                    }
                }
                let _ = reply.send(Ok(registrations));
            },
        );
    }

    fn stored_info(&self, data: &RegistrationData) -> RegistrationInfo {
        if let Some(info) = self.live.registration_info(data.registration_id) {
            return info;
        }
        let version = self
            .live
            .version_info(data.version_id)
            .unwrap_or_else(|| VersionInfo {
                version_id: data.version_id,
                script_url: data.script.clone(),
                status: if data.is_active {
                    VersionStatus::Activated
                } else {
                    VersionStatus::Installed
                },
            });
        let (active_version, waiting_version) = if data.is_active {
            (Some(version), None)
        } else {
            (None, Some(version))
        };
        RegistrationInfo {
            registration_id: data.registration_id,
            scope: data.scope.clone(),
            active_version,
            waiting_version,
            installing_version: None,
            stored_version_size_bytes: data.resources_total_size_bytes,
            is_deleted: self.pending_deletions.contains(&data.registration_id),
        }
    }

    fn get_all_registrations_infos(&mut self, reply: Reply<Vec<RegistrationInfo>>) {
        self.post(
            |store| async move { store.get_all_registrations().await },
            move |core, result| {
                let stored = match result {
                    Ok(stored) => stored,
                    Err(e) => {
                        let status = core.escalate("get_all_registrations_infos", e);
                        let _ = reply.send(Err(status));
                        return;
                    }
                };

                let mut infos: Vec<RegistrationInfo> =
                    stored.iter().map(|data| core.stored_info(data)).collect();
                for id in &core.installing {
                    if infos.iter().any(|i| i.registration_id == *id) {
                        continue;
                    }
                    if let Some(info) = core.live.registration_info(*id) {
                        infos.push(info);
                    }
                }
                let _ = reply.send(Ok(infos));
            },
        );
    }

    fn store_registration(
        &mut self,
        registration_id: RegistrationId,
        version_id: VersionId,
        reply: Reply<()>,
    ) {
        let (Some(registration), Some(version)) = (
            self.live.registration(registration_id),
            self.live.version(version_id),
        ) else {
            tracing::warn!(
                %registration_id,
                %version_id,
                "Store of a registration that is not live"
            );
            let _ = reply.send(Err(StorageStatusError::Failed));
            return;
        };
        let resources = version.script_cache_map.get_resources();
        if resources.is_empty() {
            tracing::warn!(
                %registration_id,
                %version_id,
                "Refusing to store a version without resources"
            );
            let _ = reply.send(Err(StorageStatusError::Failed));
            return;
        }
        let Ok(origin) = registration.origin() else {
            let _ = reply.send(Err(StorageStatusError::Failed));
            return;
        };

        let mut data = RegistrationData::new(
            registration_id,
            registration.scope.clone(),
            version.script_url.clone(),
            version_id,
        );
        data.is_active = registration.active_version == Some(version_id);
        data.has_fetch_handler = version.has_fetch_handler;
        data.last_update_check = registration.last_update_check;
        data.resources_total_size_bytes = total_size(&resources);
        let new_size = data.resources_total_size_bytes;

        self.ensure_stale_check();
        self.live
            .with_registration_mut(registration_id, |r| r.is_deleted = false);

        self.post(
            move |store| async move { store.write_registration(&data, &resources).await },
            move |core, result| match result {
                Ok(outcome) => {
                    core.registered_origins.insert(origin.clone());
                    core.live.with_registration_mut(registration_id, |r| {
                        r.resources_total_size_bytes = new_size;
                    });
                    let old_size = outcome
                        .deleted_version
                        .as_ref()
                        .map_or(0, |d| d.resources_total_size_bytes);
                    core.report_size_change(&origin, new_size as i64 - old_size as i64);
                    tracing::debug!(%registration_id, %version_id, %origin, "Registration stored");
                    core.emit(StorageEvent::RegistrationStored {
                        registration_id,
                        version_id,
                        origin,
                    });
                    let _ = reply.send(Ok(()));

                    if let Some(deleted) = outcome.deleted_version
                        && !core.live.has_version(deleted.version_id)
                    {
                        core.start_purging(outcome.newly_purgeable);
                    }
                }
                Err(e) => {
                    let status = core.escalate_any("store_registration", e);
                    let _ = reply.send(Err(status));
                }
            },
        );
    }

    fn update_to_active_state(
        &mut self,
        registration_id: RegistrationId,
        origin: Origin,
        reply: Reply<()>,
    ) {
        self.post(
            move |store| async move {
                store
                    .update_version_to_active(registration_id, &origin)
                    .await
            },
            move |core, result| {
                let status = result.map_err(|e| core.escalate("update_to_active_state", e));
                let _ = reply.send(status);
            },
        );
    }

    fn update_last_update_check_time(
        &mut self,
        registration_id: RegistrationId,
        origin: Origin,
        time: OffsetDateTime,
        reply: Reply<()>,
    ) {
        self.live
            .with_registration_mut(registration_id, |r| r.last_update_check = time);
        self.post(
            move |store| async move {
                store
                    .update_last_check_time(registration_id, &origin, time)
                    .await
            },
            move |core, result| {
                let status = result.map_err(|e| core.escalate("update_last_update_check_time", e));
                let _ = reply.send(status);
            },
        );
    }

    fn delete_registration(
        &mut self,
        registration_id: RegistrationId,
        origin: Origin,
        reply: Reply<()>,
    ) {
        self.ensure_stale_check();
        self.pending_deletions.insert(registration_id);
        self.live
            .with_registration_mut(registration_id, |r| r.is_deleted = true);

        let target = origin.clone();
        self.post(
            move |store| async move { store.delete_registration(registration_id, &target).await },
            move |core, result| {
                core.pending_deletions.remove(&registration_id);
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let status = core.escalate_any("delete_registration", e);
                        let _ = reply.send(Err(status));
                        return;
                    }
                };

                let freed = outcome
                    .deleted_version
                    .as_ref()
                    .map_or(0, |deleted| deleted.resources_total_size_bytes);
                core.report_size_change(&origin, -(freed as i64));
                if outcome.origin_removed {
                    core.registered_origins.remove(&origin);
                }
                tracing::debug!(%registration_id, %origin, "Registration deleted");
                core.emit(StorageEvent::RegistrationDeleted {
                    registration_id,
                    origin,
                });
                let _ = reply.send(Ok(()));

                if let Some(deleted) = outcome.deleted_version
                    && !core.live.has_version(deleted.version_id)
                {
                    core.start_purging(outcome.newly_purgeable);
                }
            },
        );
    }

    fn create_resource_writer(&mut self, resource_id: ResourceId, reply: Reply<ResourceWriter>) {
        if !resource_id.is_valid() {
            let _ = reply.send(Err(StorageStatusError::Failed));
            return;
        }
        self.ensure_stale_check();
        self.post(
            move |store| async move { lifecycle::mark_uncommitted(&*store, &[resource_id]).await },
            move |core, result| {
                let writer = match result {
                    Ok(()) => Ok(ResourceWriter::new(core.blob_cache.clone(), resource_id)),
                    Err(e) => Err(core.escalate_any("create_resource_writer", e)),
                };
                let _ = reply.send(writer);
            },
        );
    }

    fn store_uncommitted_resource_id(&mut self, resource_id: ResourceId) {
        self.ensure_stale_check();
        self.post(
            move |store| async move { lifecycle::mark_uncommitted(&*store, &[resource_id]).await },
            |core, result| {
                if let Err(e) = result {
                    core.escalate_any("store_uncommitted_resource_id", e);
                }
            },
        );
    }

    fn doom_uncommitted_resources(&mut self, resource_ids: Vec<ResourceId>) {
        if resource_ids.is_empty() {
            return;
        }
        self.ensure_stale_check();
        let ids = resource_ids.clone();
        self.post(
            move |store| async move { lifecycle::mark_uncommitted_purgeable(&*store, &ids).await },
            |core, result| {
                if let Err(e) = result {
                    core.escalate_any("doom_uncommitted_resources", e);
                }
            },
        );
        self.start_purging(resource_ids);
    }

    fn notify_done_installing(
        &mut self,
        registration_id: RegistrationId,
        version_id: Option<VersionId>,
        success: bool,
    ) {
        self.installing.remove(&registration_id);
        if success {
            return;
        }
        let resource_ids = version_id
            .and_then(|id| self.live.version(id))
            .map(|v| v.script_cache_map.resource_ids())
            .unwrap_or_default();
        if !resource_ids.is_empty() {
            self.dispatch(Request::DoomUncommittedResources { resource_ids });
        }
    }

    fn store_user_data(
        &mut self,
        registration_id: RegistrationId,
        origin: Origin,
        key: String,
        value: Vec<u8>,
        reply: Reply<()>,
    ) {
        if !registration_id.is_valid() || key.is_empty() {
            let _ = reply.send(Err(StorageStatusError::Failed));
            return;
        }
        self.post(
            move |store| async move {
                store
                    .write_user_data(registration_id, &origin, &key, &value)
                    .await
            },
            move |core, result| {
                let status = result.map_err(|e| core.escalate("store_user_data", e));
                let _ = reply.send(status);
            },
        );
    }

    fn get_user_data(
        &mut self,
        registration_id: RegistrationId,
        key: String,
        reply: Reply<Vec<u8>>,
    ) {
        if !registration_id.is_valid() || key.is_empty() {
            let _ = reply.send(Err(StorageStatusError::Failed));
            return;
        }
        self.post(
            move |store| async move { store.read_user_data(registration_id, &key).await },
            move |core, result| {
                let value = result.map_err(|e| core.escalate("get_user_data", e));
                let _ = reply.send(value);
            },
        );
    }

    fn clear_user_data(&mut self, registration_id: RegistrationId, key: String, reply: Reply<()>) {
        if !registration_id.is_valid() || key.is_empty() {
            let _ = reply.send(Err(StorageStatusError::Failed));
            return;
        }
        self.post(
            move |store| async move { store.delete_user_data(registration_id, &key).await },
            move |core, result| {
                let status = result.map_err(|e| core.escalate_any("clear_user_data", e));
                let _ = reply.send(status);
            },
        );
    }

    fn get_user_data_for_all_registrations(
        &mut self,
        key: String,
        reply: Reply<Vec<(RegistrationId, Vec<u8>)>>,
    ) {
        if key.is_empty() {
            let _ = reply.send(Err(StorageStatusError::Failed));
            return;
        }
        self.post(
            move |store| async move { store.read_user_data_for_all_registrations(&key).await },
            move |core, result| {
                let values = result
                    .map_err(|e| core.escalate_any("get_user_data_for_all_registrations", e));
                let _ = reply.send(values);
            },
        );
    }

    fn shutdown(&mut self, reply: oneshot::Sender<()>) {
        let session_only: Vec<Origin> = match &self.session_policy {
            Some(policy)
                if self.state == CoordinatorState::Initialized
                    && policy.has_session_only_origins() =>
            {
                self.registered_origins
                    .iter()
                    .filter(|origin| policy.is_session_only(origin))
                    .cloned()
                    .collect()
            }
            _ => Vec::new(),
        };

        if !session_only.is_empty() {
            tracing::info!(count = session_only.len(), "Deleting session-only origins");
            self.post(
                move |store| async move { store.delete_all_data_for_origins(&session_only).await },
                |_, result| {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Failed to delete session-only origins");
                    }
                },
            );
        }

        for request in std::mem::take(&mut self.pending) {
            request.fail();
        }
        self.post(
            |_| async {},
            move |core, ()| core.stopping = Some(reply),
        );
    }
}
