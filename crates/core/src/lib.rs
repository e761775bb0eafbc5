//! Core domain types for the roster registration store.
//!
//! This crate defines the data model shared by every other crate:
//! - Registration, version and resource identifiers
//! - Origins, scopes and longest-scope matching
//! - Durable registration records and resource lists
//! - Configuration for the metadata store and blob cache

pub mod config;
pub mod error;
pub mod ids;
pub mod origin;
pub mod registration;
pub mod scope;

pub use error::{Error, Result};
pub use ids::{RegistrationId, ResourceId, VersionId};
pub use origin::Origin;
pub use registration::{
    RegistrationData, RegistrationInfo, ResourceRecord, VersionInfo, VersionStatus, total_size,
};
pub use scope::{LongestScopeMatcher, scope_matches};

/// Current schema version of the registration store.
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

/// Default memory budget for the in-memory blob cache: 10 MiB.
pub const DEFAULT_MEMORY_CACHE_BYTES: u64 = 10 * 1024 * 1024;
