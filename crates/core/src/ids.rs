//! Numeric identifiers for registrations, versions and resources.
//!
//! All three are unsigned, globally unique and allocated from monotonic
//! counters kept by the registration store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::TryFromIntError;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[derive(Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Sentinel for "no id". Never allocated by the store.
            pub const INVALID: Self = Self(u64::MAX);

            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            pub const fn is_valid(self) -> bool {
                self.0 != u64::MAX
            }
        }

        /// Value as stored in an SQLite INTEGER column. Fails above `i64::MAX`.
        impl TryFrom<$name> for i64 {
            type Error = TryFromIntError;

            fn try_from(id: $name) -> Result<Self, Self::Error> {
                i64::try_from(id.0)
            }
        }

        impl TryFrom<i64> for $name {
            type Error = TryFromIntError;

            fn try_from(raw: i64) -> Result<Self, Self::Error> {
                u64::try_from(raw).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

define_id!(
    /// Identifier of a registration.
    RegistrationId
);

define_id!(
    /// Identifier of one script version of a registration.
    VersionId
);

define_id!(
    /// Identifier of a cached resource blob.
    ResourceId
);
