//! Metadata schema version

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `major.minor.patch` version of the metadata schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    /// Version written while an upgrade is in flight
    pub const UPGRADING: SchemaVersion = SchemaVersion::new(0, 0, 0);

    /// Version this build creates and operates on
    pub const CURRENT: SchemaVersion = SchemaVersion::new(2, 1, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn is_upgrading(&self) -> bool {
        *self == Self::UPGRADING
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SchemaVersion {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(crate::Error::MetadataCorrupted(format!(
                "invalid schema version '{}'",
                s
            )));
        }
        let parse = |p: &str| {
            p.parse::<u32>().map_err(|_| {
                crate::Error::MetadataCorrupted(format!("invalid schema version '{}'", s))
            })
        };
        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}
