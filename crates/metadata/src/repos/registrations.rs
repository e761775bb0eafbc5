//! Registration records, resource lists and the origin index.

use crate::error::MetadataResult;
use async_trait::async_trait;
use roster_core::{Origin, RegistrationData, RegistrationId, ResourceId, ResourceRecord};
use serde::Serialize;
use std::collections::BTreeSet;
use time::OffsetDateTime;

/// A registration together with its stored version's resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredRegistration {
    pub data: RegistrationData,
    pub resources: Vec<ResourceRecord>,
}

/// Result of replacing a registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// The record that was replaced, if any.
    pub deleted_version: Option<RegistrationData>,
    /// Resources of the replaced version that are no longer referenced.
    pub newly_purgeable: Vec<ResourceId>,
}

/// Result of deleting a registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// The deleted record. `None` when nothing was stored.
    pub deleted_version: Option<RegistrationData>,
    pub newly_purgeable: Vec<ResourceId>,
    /// True when the origin left the origin index in the same transaction.
    pub origin_removed: bool,
}

/// Repository for registrations.
#[async_trait]
pub trait RegistrationRepo: Send + Sync {
    /// Atomically insert or replace the registration with `data.registration_id`.
    ///
    /// Old resources become purgeable and the new ones leave the uncommitted set.
    async fn write_registration(
        &self,
        data: &RegistrationData,
        resources: &[ResourceRecord],
    ) -> MetadataResult<WriteOutcome>;

    /// Read one registration. `NotFound` when absent.
    async fn read_registration(
        &self,
        registration_id: RegistrationId,
        origin: &Origin,
    ) -> MetadataResult<StoredRegistration>;

    /// Origin a registration is stored under. `NotFound` when absent.
    async fn read_registration_origin(
        &self,
        registration_id: RegistrationId,
    ) -> MetadataResult<Origin>;

    /// Delete a registration with its resources and user data.
    ///
    /// Deleting a registration that does not exist succeeds with an empty outcome.
    async fn delete_registration(
        &self,
        registration_id: RegistrationId,
        origin: &Origin,
    ) -> MetadataResult<DeleteOutcome>;

    /// All registrations of an origin ordered by id.
    ///
    /// When `include_resources` is false the resource lists are left empty.
    async fn get_registrations_for_origin(
        &self,
        origin: &Origin,
        include_resources: bool,
    ) -> MetadataResult<Vec<StoredRegistration>>;

    /// Every stored registration ordered by id, without resources.
    async fn get_all_registrations(&self) -> MetadataResult<Vec<RegistrationData>>;

    /// Origins with at least one stored registration.
    async fn get_origins_with_registrations(&self) -> MetadataResult<BTreeSet<Origin>>;

    /// Mark the stored version as active. `NotFound` when absent.
    async fn update_version_to_active(
        &self,
        registration_id: RegistrationId,
        origin: &Origin,
    ) -> MetadataResult<()>;

    /// Set the last update check time. `NotFound` when absent.
    async fn update_last_check_time(
        &self,
        registration_id: RegistrationId,
        origin: &Origin,
        time: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Remove everything stored for `origins` in one transaction.
    ///
    /// Returns the resource ids that became purgeable.
    async fn delete_all_data_for_origins(
        &self,
        origins: &[Origin],
    ) -> MetadataResult<Vec<ResourceId>>;
}
