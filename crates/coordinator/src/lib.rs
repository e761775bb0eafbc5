//! Storage coordinator for roster.
//!
//! This crate ties the metadata store and the blob cache together:
//! - A storage actor that lazily initializes and serializes metadata work
//! - Scope-matching lookups that prefer live objects
//! - Resource purging with a one-shot stale resource check
//! - Corruption recovery by deleting everything and starting over
//! - Events, quota reporting and session-only cleanup at shutdown

mod actor;
pub mod context;
mod coordinator;
pub mod error;
pub mod events;
mod lifecycle;
pub mod quota;
mod request;
pub mod script_cache;
mod sequence;

pub use actor::CoordinatorState;
pub use context::{LiveRegistration, LiveRegistry, LiveVersion};
pub use coordinator::{CoordinatorOptions, StorageCoordinator};
pub use error::{StatusResult, StorageStatusError};
pub use events::StorageEvent;
pub use quota::{QuotaObserver, SessionPolicy};
pub use script_cache::{ScriptCacheError, ScriptCacheMap};
