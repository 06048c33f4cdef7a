//! The catalog file-name grammar: `<blueprintHash>v<schemaVersion>.<platform>`.

use std::{
    fmt,
    fmt::{Display, Formatter},
    str::FromStr,
};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{BlueprintHash, ParsePlatformError, Platform};

/// The catalog schema version this build writes and accepts.
pub const CATALOG_VERSION: u32 = 14;

static CATALOG_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<hash>[0-9a-f]{64})v(?P<ver>[0-9]+)\.(?P<platform>[a-z0-9_]+)$")
        .expect("catalog name regex must compile")
});

/// A parsed catalog file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CatalogName {
    /// The blueprint the catalog was recorded for.
    pub hash: BlueprintHash,
    /// The schema version the catalog was written with.
    pub version: u32,
    /// The platform the catalog was recorded on.
    pub platform: Platform,
}

/// Rejection reasons for catalog file names. Any name that does not match
/// the documented grammar is an error, never a silent miscompare.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ParseCatalogNameError {
    /// The name does not match `<hash>v<digits>.<platform>`.
    #[error("malformed catalog name '{0}'")]
    MalformedCatalogName(String),

    /// The platform tag is not one this build knows.
    #[error("catalog name '{0}' has an unknown platform tag")]
    UnknownPlatform(String, #[source] ParsePlatformError),
}

impl CatalogName {
    /// The name for a blueprint on a platform at the current schema version.
    pub fn new(hash: BlueprintHash, platform: Platform) -> Self {
        CatalogName {
            hash,
            version: CATALOG_VERSION,
            platform,
        }
    }

    /// True when this catalog can be loaded by this build on `platform`.
    pub fn is_loadable_on(&self, platform: Platform) -> bool {
        self.version == CATALOG_VERSION && self.platform == platform
    }
}

impl FromStr for CatalogName {
    type Err = ParseCatalogNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = CATALOG_NAME_RE
            .captures(s)
            .ok_or_else(|| ParseCatalogNameError::MalformedCatalogName(s.to_owned()))?;
        let hash: BlueprintHash = captures["hash"]
            .parse()
            .map_err(|_| ParseCatalogNameError::MalformedCatalogName(s.to_owned()))?;
        let version: u32 = captures["ver"]
            .parse()
            .map_err(|_| ParseCatalogNameError::MalformedCatalogName(s.to_owned()))?;
        let platform: Platform = captures["platform"]
            .parse()
            .map_err(|e| ParseCatalogNameError::UnknownPlatform(s.to_owned(), e))?;
        Ok(CatalogName {
            hash,
            version,
            platform,
        })
    }
}

impl Display for CatalogName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}.{}", self.hash, self.version, self.platform)
    }
}
