//! Uncommitted and purgeable resource tracking.
//!
//! The persisted sets live in the metadata store; this module owns the
//! in-memory purge queue and the one-shot stale check.

use roster_core::ResourceId;
use roster_metadata::repos::ResourceIdRepo;
use roster_metadata::{MetadataResult, MetadataStore};
use std::collections::VecDeque;

/// In-memory purge queue with at most one doom in flight.
#[derive(Debug, Default)]
pub(crate) struct ResourceLifecycle {
    queue: VecDeque<ResourceId>,
    in_flight: Option<ResourceId>,
    has_checked_for_stale: bool,
}

impl ResourceLifecycle {
    /// Queue ids for purging. Ids already queued or in flight are skipped.
    pub fn mark_purgeable(&mut self, ids: impl IntoIterator<Item = ResourceId>) {
        for id in ids {
            if self.in_flight != Some(id) && !self.queue.contains(&id) {
                self.queue.push_back(id);
            }
        }
    }

    pub fn is_purge_pending(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// The next id to doom, unless one is already in flight.
    pub fn next_purge(&mut self) -> Option<ResourceId> {
        if self.in_flight.is_some() {
            return None;
        }
        let id = self.queue.pop_front()?;
        self.in_flight = Some(id);
        Some(id)
    }

    /// Returns false for a doom this tracker no longer waits for.
    pub fn finish_purge(&mut self, id: ResourceId) -> bool {
        if self.in_flight != Some(id) {
            return false;
        }
        self.in_flight = None;
        true
    }

    /// True exactly once per store lifetime.
    pub fn begin_stale_check(&mut self) -> bool {
        !std::mem::replace(&mut self.has_checked_for_stale, true)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Record ids as uncommitted before their bodies are written.
pub(crate) async fn mark_uncommitted(
    store: &dyn MetadataStore,
    ids: &[ResourceId],
) -> MetadataResult<()> {
    store.write_uncommitted_resource_ids(ids).await
}

/// Move uncommitted ids to the purgeable set.
pub(crate) async fn mark_uncommitted_purgeable(
    store: &dyn MetadataStore,
    ids: &[ResourceId],
) -> MetadataResult<()> {
    store.purge_uncommitted_resource_ids(ids).await
}

/// Collect what a previous run left behind.
///
/// Every uncommitted id becomes purgeable, then the whole purgeable set is
/// returned for queueing.
pub(crate) async fn collect_stale_resources(
    store: &dyn MetadataStore,
) -> MetadataResult<Vec<ResourceId>> {
    let uncommitted: Vec<ResourceId> = store
        .get_uncommitted_resource_ids()
        .await?
        .into_iter()
        .collect();
    if !uncommitted.is_empty() {
        store.purge_uncommitted_resource_ids(&uncommitted).await?;
    }
    Ok(store.get_purgeable_resource_ids().await?.into_iter().collect())
}
