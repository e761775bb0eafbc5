//! Web origin type used as the primary index of the store.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// A tuple origin (`scheme://host[:port]`) in its ASCII serialization.
///
/// Opaque origins (`data:`, `blob:` of opaque, etc.) are rejected because
/// registrations can never be keyed by them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Origin(String);

impl Origin {
    /// Origin of the given URL.
    pub fn of(url: &Url) -> Result<Self> {
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(Error::OpaqueOrigin(url.to_string()));
        }
        Ok(Self(origin.ascii_serialization()))
    }

    /// Parse an origin from either a bare origin string or any URL.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)?;
        Self::of(&url)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `url` belongs to this origin.
    pub fn contains(&self, url: &Url) -> bool {
        url.origin().ascii_serialization() == self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Origin {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Origin> for String {
    fn from(origin: Origin) -> Self {
        origin.0
    }
}
