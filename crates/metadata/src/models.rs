//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use roster_core::{RegistrationData, ResourceRecord};
use sqlx::FromRow;
use std::fmt;
use time::OffsetDateTime;
use url::Url;

// =============================================================================
// Registrations
// =============================================================================

/// Registration record as stored.
#[derive(Debug, Clone, FromRow)]
pub struct RegistrationRow {
    pub origin: String,
    pub registration_id: i64,
    pub scope: String,
    pub script: String,
    pub version_id: i64,
    pub is_active: bool,
    pub has_fetch_handler: bool,
    /// Microseconds since the Unix epoch.
    pub last_update_check_us: i64,
    pub resources_total_size_bytes: i64,
}

impl RegistrationRow {
    /// Fails with `InvalidArguments` when a value does not fit its column.
    pub fn from_data(origin: &str, data: &RegistrationData) -> MetadataResult<Self> {
        Ok(Self {
            origin: origin.to_string(),
            registration_id: sql_id(data.registration_id)?,
            scope: data.scope.to_string(),
            script: data.script.to_string(),
            version_id: sql_id(data.version_id)?,
            is_active: data.is_active,
            has_fetch_handler: data.has_fetch_handler,
            last_update_check_us: to_micros(data.last_update_check),
            resources_total_size_bytes: sql_size(data.resources_total_size_bytes)?,
        })
    }

    pub fn into_data(self) -> MetadataResult<RegistrationData> {
        if self.registration_id < 0 || self.version_id < 0 || self.resources_total_size_bytes < 0 {
            return Err(MetadataError::Corruption(format!(
                "negative id or size in registration {}",
                self.registration_id
            )));
        }
        Ok(RegistrationData {
            registration_id: stored_id(self.registration_id)?,
            scope: parse_url(&self.scope)?,
            script: parse_url(&self.script)?,
            version_id: stored_id(self.version_id)?,
            is_active: self.is_active,
            has_fetch_handler: self.has_fetch_handler,
            last_update_check: from_micros(self.last_update_check_us)?,
            resources_total_size_bytes: self.resources_total_size_bytes as u64,
        })
    }
}

// =============================================================================
// Resources
// =============================================================================

/// One entry of a version's resource list.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceRow {
    pub version_id: i64,
    pub position: i64,
    pub resource_id: i64,
    pub url: String,
    pub size_bytes: i64,
}

impl ResourceRow {
    pub fn into_record(self) -> MetadataResult<ResourceRecord> {
        if self.resource_id < 0 || self.size_bytes < 0 {
            return Err(MetadataError::Corruption(format!(
                "negative id or size in resource of version {}",
                self.version_id
            )));
        }
        Ok(ResourceRecord {
            resource_id: stored_id(self.resource_id)?,
            url: parse_url(&self.url)?,
            size_bytes: self.size_bytes as u64,
        })
    }
}

// =============================================================================
// User data
// =============================================================================

/// Opaque value keyed by registration and key.
#[derive(Debug, Clone, FromRow)]
pub struct UserDataRow {
    pub registration_id: i64,
    pub key: String,
    pub value: Vec<u8>,
}

/// Column value of an id. Ids above `i64::MAX` cannot be stored.
pub(crate) fn sql_id<T>(id: T) -> MetadataResult<i64>
where
    T: TryInto<i64> + Copy + fmt::Display,
{
    id.try_into()
        .map_err(|_| MetadataError::InvalidArguments(format!("id {id} is out of range")))
}

/// Counter value that follows `id`.
pub(crate) fn counter_after<T>(id: T) -> MetadataResult<i64>
where
    T: TryInto<i64> + Copy + fmt::Display,
{
    sql_id(id)?
        .checked_add(1)
        .ok_or_else(|| MetadataError::InvalidArguments(format!("id {id} is out of range")))
}

/// Id read back from a column.
pub(crate) fn stored_id<T: TryFrom<i64>>(raw: i64) -> MetadataResult<T> {
    T::try_from(raw).map_err(|_| MetadataError::Corruption(format!("negative id {raw}")))
}

pub(crate) fn sql_size(size: u64) -> MetadataResult<i64> {
    i64::try_from(size)
        .map_err(|_| MetadataError::InvalidArguments(format!("size {size} is out of range")))
}

fn parse_url(raw: &str) -> MetadataResult<Url> {
    Url::parse(raw).map_err(|e| MetadataError::Corruption(format!("unparsable url {raw:?}: {e}")))
}

/// Convert a timestamp to microseconds since the epoch.
pub fn to_micros(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000) as i64
}

/// Convert microseconds since the epoch back to a timestamp.
pub fn from_micros(us: i64) -> MetadataResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(us) * 1_000)
        .map_err(|e| MetadataError::Corruption(format!("timestamp out of range: {e}")))
}
