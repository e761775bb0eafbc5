pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{both_backends, seeded_bytes};
