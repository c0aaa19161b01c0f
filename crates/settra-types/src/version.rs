//! Setting declaration versions.

use crate::error::TypeError;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A `(major, minor)` declaration version, ordered lexicographically.
///
/// The wire form is `"MAJOR.MINOR"`. New settings start at `1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SettingVersion {
    pub major: u32,
    pub minor: u32,
}

impl SettingVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The version assigned to first declarations.
    pub const INITIAL: Self = Self::new(1, 0);
}

impl Default for SettingVersion {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl fmt::Display for SettingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for SettingVersion {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TypeError::InvalidVersion(s.to_string());
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        if major.is_empty() || minor.is_empty() {
            return Err(invalid());
        }
        if !major.bytes().all(|b| b.is_ascii_digit()) || !minor.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for SettingVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SettingVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats() {
        let version: SettingVersion = "2.13".parse().expect("version should parse");
        assert_eq!(version, SettingVersion::new(2, 13));
        assert_eq!(version.to_string(), "2.13");
    }

    #[test]
    fn rejects_malformed_versions() {
        for text in ["", "1", "1.", ".0", "1.0.0", "a.b", "-1.0", "1.0 "] {
            assert!(text.parse::<SettingVersion>().is_err(), "accepted {text:?}");
        }
    }

    #[test]
    fn orders_lexicographically() {
        let parse = |s: &str| s.parse::<SettingVersion>().expect("version should parse");
        assert!(parse("1.0") < parse("1.1"));
        assert!(parse("1.9") < parse("2.0"));
        assert!(parse("2.0") < parse("2.10"));
        assert_eq!(SettingVersion::default(), parse("1.0"));
    }
}
