//! Storage events broadcast to subscribers.

use roster_core::{Origin, RegistrationId, ResourceId, VersionId};
use serde::Serialize;

/// Default capacity of the event channel. Slow subscribers observe `Lagged`.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something durable happened in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StorageEvent {
    RegistrationStored {
        registration_id: RegistrationId,
        version_id: VersionId,
        origin: Origin,
    },
    RegistrationDeleted {
        registration_id: RegistrationId,
        origin: Origin,
    },
    /// The blob is gone and the id left the purgeable set.
    ResourcePurged { resource_id: ResourceId },
    /// Leftovers from a previous run were queued for purging.
    StaleResourcesCollected { count: usize },
    DeleteAndStartOverScheduled,
    /// Recovery finished; the store is empty and usable again.
    StorageReset,
    /// Recovery gave up. The coordinator stays disabled.
    ResetFailed { reason: String },
}
