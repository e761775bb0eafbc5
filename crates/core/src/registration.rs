//! Durable registration records and their resource lists.

use crate::error::{Error, Result};
use crate::ids::{RegistrationId, ResourceId, VersionId};
use crate::origin::Origin;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

/// Lifecycle status of a worker version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    New,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }

    /// Whether resources may still be added to a version in this status.
    pub fn accepts_new_resources(&self) -> bool {
        matches!(self, Self::New | Self::Installing)
    }
}

/// One cached script resource of a version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_id: ResourceId,
    pub url: Url,
    pub size_bytes: u64,
}

impl ResourceRecord {
    pub fn new(resource_id: impl Into<ResourceId>, url: Url, size_bytes: u64) -> Self {
        Self {
            resource_id: resource_id.into(),
            url,
            size_bytes,
        }
    }
}

/// The durable record of a registration and its stored version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationData {
    pub registration_id: RegistrationId,
    pub scope: Url,
    pub script: Url,
    pub version_id: VersionId,
    pub is_active: bool,
    pub has_fetch_handler: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update_check: OffsetDateTime,
    pub resources_total_size_bytes: u64,
}

impl RegistrationData {
    /// A record with every optional attribute zeroed.
    pub fn new(
        registration_id: RegistrationId,
        scope: Url,
        script: Url,
        version_id: VersionId,
    ) -> Self {
        Self {
            registration_id,
            scope,
            script,
            version_id,
            is_active: false,
            has_fetch_handler: false,
            last_update_check: OffsetDateTime::UNIX_EPOCH,
            resources_total_size_bytes: 0,
        }
    }

    /// Origin the record is indexed under.
    pub fn origin(&self) -> Result<Origin> {
        Origin::of(&self.scope)
    }

    /// Check the record can be indexed under `origin`.
    pub fn validate_for(&self, origin: &Origin) -> Result<()> {
        if self.scope.fragment().is_some() {
            return Err(Error::InvalidScope(self.scope.to_string()));
        }
        if !origin.contains(&self.scope) {
            return Err(Error::OriginMismatch {
                scope: self.scope.to_string(),
                origin: origin.to_string(),
            });
        }
        Ok(())
    }
}

/// Sum of resource sizes.
pub fn total_size(resources: &[ResourceRecord]) -> u64 {
    resources.iter().map(|r| r.size_bytes).sum()
}

/// Summary of one version, used by [`RegistrationInfo`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version_id: VersionId,
    pub script_url: Url,
    pub status: VersionStatus,
}

/// Lightweight description of a registration for enumeration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub registration_id: RegistrationId,
    pub scope: Url,
    pub active_version: Option<VersionInfo>,
    pub waiting_version: Option<VersionInfo>,
    pub installing_version: Option<VersionInfo>,
    pub stored_version_size_bytes: u64,
    pub is_deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> RegistrationData {
        RegistrationData::new(
            RegistrationId::new(100),
            Url::parse("http://example.com/foo").unwrap(),
            Url::parse("http://example.com/script.js").unwrap(),
            VersionId::new(200),
        )
    }

    #[test]
    fn origin_derived_from_scope() {
        assert_eq!(data().origin().unwrap().as_str(), "http://example.com");
    }

    #[test]
    fn validate_rejects_foreign_origin() {
        let other = Origin::parse("http://example.net").unwrap();
        assert!(matches!(
            data().validate_for(&other),
            Err(Error::OriginMismatch { .. })
        ));
        let own = Origin::parse("http://example.com").unwrap();
        assert!(data().validate_for(&own).is_ok());
    }

    #[test]
    fn total_size_sums_resources() {
        let resources = vec![
            ResourceRecord::new(1, Url::parse("http://example.com/a.js").unwrap(), 10939),
            ResourceRecord::new(2, Url::parse("http://example.com/b.js").unwrap(), 200),
        ];
        assert_eq!(total_size(&resources), 11139);
    }

    #[test]
    fn only_new_and_installing_accept_resources() {
        assert!(VersionStatus::New.accepts_new_resources());
        assert!(VersionStatus::Installing.accepts_new_resources());
        assert!(!VersionStatus::Installed.accepts_new_resources());
        assert!(!VersionStatus::Redundant.accepts_new_resources());
    }
}
