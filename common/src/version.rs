// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The platform version, as embedded in backup archives and exposed to the
//! running process via the `CROWBAR_VERSION` environment variable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the environment variable holding the running platform version.
pub const VERSION_ENV: &str = "CROWBAR_VERSION";

/// A `<major>.<minor>` platform version.
///
/// Ordering is numeric on the `(major, minor)` tuple, so `"10.0"` compares
/// greater than `"9.1"` where a plain string comparison would not.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct PlatformVersion {
    pub major: u64,
    pub minor: u64,
}

impl PlatformVersion {
    pub const fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// The version of the currently running platform, from the environment.
    pub fn running() -> Result<Self, VersionError> {
        let raw = std::env::var(VERSION_ENV)
            .map_err(|_| VersionError::Unset { var: VERSION_ENV })?;
        raw.parse()
    }

    /// Parse a version out of the first line of a version marker file,
    /// ignoring anything after the `<major>.<minor>` prefix.
    pub fn from_marker(contents: &str) -> Result<Self, VersionError> {
        let line = contents.lines().next().unwrap_or("");
        let prefix: String = line
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        prefix.parse()
    }
}

impl FromStr for PlatformVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_err = || VersionError::Parse { input: s.to_string() };
        let (major, minor) = s.trim().split_once('.').ok_or_else(parse_err)?;
        // Reject things like "1.2.3" so a marker that is really a semver
        // string surfaces as a parse error instead of silently truncating.
        if minor.contains('.') {
            return Err(parse_err());
        }
        Ok(Self {
            major: major.parse().map_err(|_| parse_err())?,
            minor: minor.parse().map_err(|_| parse_err())?,
        })
    }
}

impl TryFrom<String> for PlatformVersion {
    type Error = VersionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PlatformVersion> for String {
    fn from(v: PlatformVersion) -> String {
        v.to_string()
    }
}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("environment variable {var} is not set")]
    Unset { var: &'static str },

    #[error("cannot parse platform version from {input:?}")]
    Parse { input: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_major_minor() {
        let v: PlatformVersion = "5.0".parse().unwrap();
        assert_eq!(v, PlatformVersion::new(5, 0));
        assert_eq!(v.to_string(), "5.0");
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<PlatformVersion>().is_err());
        assert!("5".parse::<PlatformVersion>().is_err());
        assert!("5.0.1".parse::<PlatformVersion>().is_err());
        assert!("five.oh".parse::<PlatformVersion>().is_err());
    }

    #[test]
    fn orders_numerically() {
        let old: PlatformVersion = "9.1".parse().unwrap();
        let new: PlatformVersion = "10.0".parse().unwrap();
        assert!(new > old);
    }

    #[test]
    fn marker_tolerates_trailing_text() {
        let v = PlatformVersion::from_marker("6.0 (devel)\nignored\n").unwrap();
        assert_eq!(v, PlatformVersion::new(6, 0));
        assert!(PlatformVersion::from_marker("no version here").is_err());
    }
}
