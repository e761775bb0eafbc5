//! Repository traits for metadata operations.

pub mod meta;
pub mod registrations;
pub mod resource_ids;
pub mod user_data;

pub use meta::{MetaRepo, NextIds};
pub use registrations::{DeleteOutcome, RegistrationRepo, StoredRegistration, WriteOutcome};
pub use resource_ids::ResourceIdRepo;
pub use user_data::UserDataRepo;
