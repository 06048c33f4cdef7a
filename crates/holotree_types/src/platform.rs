//! Platform tags recorded in catalogs.

use std::{
    fmt,
    fmt::{Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{EnumIter, IntoEnumIterator};
use thiserror::Error;

/// A platform a catalog can be recorded for. Catalogs are only restorable on
/// the platform they were recorded on; the tag is part of the catalog file
/// name.
#[derive(EnumIter, Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Platform {
    /// 64-bit Linux on x86-64.
    Linux64,
    /// 64-bit Linux on ARM64.
    LinuxAarch64,
    /// 64-bit macOS on x86-64.
    Osx64,
    /// 64-bit macOS on Apple silicon.
    OsxArm64,
    /// 64-bit Windows on x86-64.
    Win64,
}

impl Platform {
    /// The platform this binary was compiled for.
    pub fn current() -> Self {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        return Platform::Linux64;

        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        return Platform::LinuxAarch64;

        #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
        return Platform::Osx64;

        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        return Platform::OsxArm64;

        #[cfg(target_os = "windows")]
        return Platform::Win64;

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        compile_error!("unsupported platform");
    }

    /// Returns a string representation of the platform.
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Linux64 => "linux_64",
            Platform::LinuxAarch64 => "linux_aarch64",
            Platform::Osx64 => "osx_64",
            Platform::OsxArm64 => "osx_arm64",
            Platform::Win64 => "win_64",
        }
    }

    /// True when the platform is Windows-based.
    pub fn is_windows(self) -> bool {
        matches!(self, Platform::Win64)
    }
}

/// An error that can occur when parsing a platform from a string.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("'{string}' is not a known platform tag")]
pub struct ParsePlatformError {
    /// The string that could not be parsed.
    pub string: String,
}

impl FromStr for Platform {
    type Err = ParsePlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::iter()
            .find(|platform| platform.as_str() == s)
            .ok_or_else(|| ParsePlatformError {
                string: s.to_owned(),
            })
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use strum::IntoEnumIterator;

    use super::Platform;

    #[rstest]
    #[case("linux_64", Platform::Linux64)]
    #[case("osx_arm64", Platform::OsxArm64)]
    #[case("win_64", Platform::Win64)]
    fn parse_round_trip(#[case] tag: &str, #[case] platform: Platform) {
        assert_eq!(tag.parse::<Platform>().unwrap(), platform);
        assert_eq!(platform.to_string(), tag);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!("amiga_68k".parse::<Platform>().is_err());
    }

    #[test]
    fn all_tags_parse_back() {
        for platform in Platform::iter() {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
    }
}
