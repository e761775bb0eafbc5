//! Hooks into the embedder's quota accounting and storage policy.

use roster_core::Origin;

/// Receives the change in stored bytes per origin.
pub trait QuotaObserver: Send + Sync {
    /// `delta` is new size minus old size; negative on deletion.
    fn notify_storage_modified(&self, origin: &Origin, delta: i64);
}

/// Decides which origins keep their data only for the current session.
pub trait SessionPolicy: Send + Sync {
    fn has_session_only_origins(&self) -> bool;

    fn is_session_only(&self, origin: &Origin) -> bool;
}
