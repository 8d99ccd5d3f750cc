//! CLI version parsing.

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// A `major.minor.patch` version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Find the first version-looking token in free-form output,
    /// e.g. `Yandex Cloud CLI 0.125.0 linux/amd64`.
    pub fn find_in(output: &str) -> Option<Self> {
        output
            .split_whitespace()
            .filter(|s| s.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .find_map(|s| s.parse().ok())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('v');
        let mut parts = s.split('.');
        let mut next = || -> Option<u32> {
            let part = parts.next()?;
            // Tolerate suffixes such as "0-rc1"
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        };

        match (next(), next(), next()) {
            (Some(major), Some(minor), patch) => Ok(Version::new(major, minor, patch.unwrap_or(0))),
            _ => Err(Error::VersionParse(s.to_string())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
