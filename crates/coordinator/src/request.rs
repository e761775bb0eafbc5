//! Messages accepted by the storage actor.

use crate::actor::CoordinatorCore;
use crate::context::LiveRegistration;
use crate::error::{StatusResult, StorageStatusError};
use roster_core::{Origin, RegistrationId, RegistrationInfo, ResourceId, VersionId};
use roster_storage::ResourceWriter;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use url::Url;

pub(crate) type Reply<T> = oneshot::Sender<StatusResult<T>>;

/// Work handed back to the actor once a job finishes elsewhere.
pub(crate) type Completion = Box<dyn FnOnce(&mut CoordinatorCore) + Send>;

pub(crate) enum Message {
    Request(Request),
    Completion(Completion),
    Purged {
        resource_id: ResourceId,
        result: roster_storage::StorageResult<()>,
    },
}

/// Caller operations. Replies travel back on the embedded oneshot.
pub(crate) enum Request {
    FindForDocument {
        document_url: Url,
        reply: Reply<LiveRegistration>,
    },
    FindForPattern {
        scope: Url,
        reply: Reply<LiveRegistration>,
    },
    FindForId {
        registration_id: RegistrationId,
        origin: Origin,
        reply: Reply<LiveRegistration>,
    },
    FindForIdOnly {
        registration_id: RegistrationId,
        reply: Reply<LiveRegistration>,
    },
    GetRegistrationsForOrigin {
        origin: Origin,
        reply: Reply<Vec<LiveRegistration>>,
    },
    GetAllRegistrationsInfos {
        reply: Reply<Vec<RegistrationInfo>>,
    },
    StoreRegistration {
        registration_id: RegistrationId,
        version_id: VersionId,
        reply: Reply<()>,
    },
    UpdateToActiveState {
        registration_id: RegistrationId,
        origin: Origin,
        reply: Reply<()>,
    },
    UpdateLastUpdateCheckTime {
        registration_id: RegistrationId,
        origin: Origin,
        time: OffsetDateTime,
        reply: Reply<()>,
    },
    DeleteRegistration {
        registration_id: RegistrationId,
        origin: Origin,
        reply: Reply<()>,
    },
    CreateResourceWriter {
        resource_id: ResourceId,
        reply: Reply<ResourceWriter>,
    },
    StoreUncommittedResourceId {
        resource_id: ResourceId,
    },
    DoomUncommittedResources {
        resource_ids: Vec<ResourceId>,
    },
    PurgeResources {
        resource_ids: Vec<ResourceId>,
    },
    StoreUserData {
        registration_id: RegistrationId,
        origin: Origin,
        key: String,
        value: Vec<u8>,
        reply: Reply<()>,
    },
    GetUserData {
        registration_id: RegistrationId,
        key: String,
        reply: Reply<Vec<u8>>,
    },
    ClearUserData {
        registration_id: RegistrationId,
        key: String,
        reply: Reply<()>,
    },
    GetUserDataForAllRegistrations {
        key: String,
        reply: Reply<Vec<(RegistrationId, Vec<u8>)>>,
    },
    NewRegistrationId {
        reply: Reply<RegistrationId>,
    },
    NewVersionId {
        reply: Reply<VersionId>,
    },
    NewResourceId {
        reply: Reply<ResourceId>,
    },
    NotifyInstalling {
        registration_id: RegistrationId,
    },
    NotifyDoneInstalling {
        registration_id: RegistrationId,
        version_id: Option<VersionId>,
        success: bool,
    },
    NotifyUninstalling {
        registration_id: RegistrationId,
    },
    NotifyDoneUninstalling {
        registration_id: RegistrationId,
    },
    GetUninstallingRegistration {
        scope: Url,
        reply: oneshot::Sender<Option<LiveRegistration>>,
    },
    IsDisabled {
        reply: oneshot::Sender<bool>,
    },
    ScheduleDeleteAndStartOver,
    Flush {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl Request {
    /// Whether the request waits for the initial load.
    pub fn requires_initialization(&self) -> bool {
        !matches!(
            self,
            Self::NotifyInstalling { .. }
                | Self::NotifyDoneInstalling { .. }
                | Self::NotifyUninstalling { .. }
                | Self::NotifyDoneUninstalling { .. }
                | Self::GetUninstallingRegistration { .. }
                | Self::IsDisabled { .. }
                | Self::ScheduleDeleteAndStartOver
                | Self::Flush { .. }
                | Self::Shutdown { .. }
        )
    }

    /// Answer with `Failed`. Requests without a reply are dropped.
    pub fn fail(self) {
        let failed = StorageStatusError::Failed;
        match self {
            Self::FindForDocument { reply, .. }
            | Self::FindForPattern { reply, .. }
            | Self::FindForId { reply, .. }
            | Self::FindForIdOnly { reply, .. } => {
                let _ = reply.send(Err(failed));
            }
            Self::GetRegistrationsForOrigin { reply, .. } => {
                let _ = reply.send(Err(failed));
            }
            Self::GetAllRegistrationsInfos { reply } => {
                let _ = reply.send(Err(failed));
            }
            Self::StoreRegistration { reply, .. }
            | Self::UpdateToActiveState { reply, .. }
            | Self::UpdateLastUpdateCheckTime { reply, .. }
            | Self::DeleteRegistration { reply, .. }
            | Self::StoreUserData { reply, .. }
            | Self::ClearUserData { reply, .. } => {
                let _ = reply.send(Err(failed));
            }
            Self::CreateResourceWriter { reply, .. } => {
                let _ = reply.send(Err(failed));
            }
            Self::GetUserData { reply, .. } => {
                let _ = reply.send(Err(failed));
            }
            Self::GetUserDataForAllRegistrations { reply, .. } => {
                let _ = reply.send(Err(failed));
            }
            Self::NewRegistrationId { reply } => {
                let _ = reply.send(Err(failed));
            }
            Self::NewVersionId { reply } => {
                let _ = reply.send(Err(failed));
            }
            Self::NewResourceId { reply } => {
                let _ = reply.send(Err(failed));
            }
            Self::GetUninstallingRegistration { reply, .. } => {
                let _ = reply.send(None);
            }
            Self::IsDisabled { reply } => {
                let _ = reply.send(true);
            }
            Self::Flush { reply } | Self::Shutdown { reply } => {
                let _ = reply.send(());
            }
            Self::StoreUncommittedResourceId { .. }
            | Self::DoomUncommittedResources { .. }
            | Self::PurgeResources { .. }
            | Self::NotifyInstalling { .. }
            | Self::NotifyDoneInstalling { .. }
            | Self::NotifyUninstalling { .. }
            | Self::NotifyDoneUninstalling { .. }
            | Self::ScheduleDeleteAndStartOver => {}
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FindForDocument { .. } => "find_registration_for_document",
            Self::FindForPattern { .. } => "find_registration_for_pattern",
            Self::FindForId { .. } => "find_registration_for_id",
            Self::FindForIdOnly { .. } => "find_registration_for_id_only",
            Self::GetRegistrationsForOrigin { .. } => "get_registrations_for_origin",
            Self::GetAllRegistrationsInfos { .. } => "get_all_registrations_infos",
            Self::StoreRegistration { .. } => "store_registration",
            Self::UpdateToActiveState { .. } => "update_to_active_state",
            Self::UpdateLastUpdateCheckTime { .. } => "update_last_update_check_time",
            Self::DeleteRegistration { .. } => "delete_registration",
            Self::CreateResourceWriter { .. } => "create_resource_writer",
            Self::StoreUncommittedResourceId { .. } => "store_uncommitted_resource_id",
            Self::DoomUncommittedResources { .. } => "doom_uncommitted_resources",
            Self::PurgeResources { .. } => "purge_resources",
            Self::StoreUserData { .. } => "store_user_data",
            Self::GetUserData { .. } => "get_user_data",
            Self::ClearUserData { .. } => "clear_user_data",
            Self::GetUserDataForAllRegistrations { .. } => "get_user_data_for_all_registrations",
            Self::NewRegistrationId { .. } => "new_registration_id",
            Self::NewVersionId { .. } => "new_version_id",
            Self::NewResourceId { .. } => "new_resource_id",
            Self::NotifyInstalling { .. } => "notify_installing",
            Self::NotifyDoneInstalling { .. } => "notify_done_installing",
            Self::NotifyUninstalling { .. } => "notify_uninstalling",
            Self::NotifyDoneUninstalling { .. } => "notify_done_uninstalling",
            Self::GetUninstallingRegistration { .. } => "get_uninstalling_registration",
            Self::IsDisabled { .. } => "is_disabled",
            Self::ScheduleDeleteAndStartOver => "schedule_delete_and_start_over",
            Self::Flush { .. } => "flush",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}
