//! Per-registration user data.

use crate::error::MetadataResult;
use async_trait::async_trait;
use roster_core::{Origin, RegistrationId};

/// Repository for opaque `(registration, key) -> bytes` values.
#[async_trait]
pub trait UserDataRepo: Send + Sync {
    /// Store a value. `NotFound` unless the registration is stored under `origin`.
    ///
    /// An empty value is stored as such and is distinct from absence.
    async fn write_user_data(
        &self,
        registration_id: RegistrationId,
        origin: &Origin,
        key: &str,
        value: &[u8],
    ) -> MetadataResult<()>;

    /// Read a value. `NotFound` when absent.
    async fn read_user_data(
        &self,
        registration_id: RegistrationId,
        key: &str,
    ) -> MetadataResult<Vec<u8>>;

    /// Delete a value. Deleting a missing value succeeds.
    async fn delete_user_data(&self, registration_id: RegistrationId, key: &str)
    -> MetadataResult<()>;

    /// Values stored under `key` for every registration, ordered by registration id.
    async fn read_user_data_for_all_registrations(
        &self,
        key: &str,
    ) -> MetadataResult<Vec<(RegistrationId, Vec<u8>)>>;
}
