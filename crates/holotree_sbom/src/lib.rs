#![deny(missing_docs)]

//! Software Bill of Materials extraction from recorded catalogs.
//!
//! The extractor walks a catalog's tree, reads `conda-meta/*.json` records
//! and pip `*.dist-info/METADATA` headers out of the library, and emits
//! either a CycloneDX 1.4 or SPDX 2.3 JSON document. Output is byte-stable:
//! components are sorted, timestamps come from the catalog's recording
//! time, and the CycloneDX serial number is derived from the blueprint hash.

mod collect;
mod document;

use std::str::FromStr;

use holotree::{catalog::Catalog, library::DiskLibrary, library::LibraryError};
use thiserror::Error;

pub use collect::{collect_components, Component, ComponentKind};
pub use document::{cyclonedx_document, spdx_document};

/// The SBOM flavors this extractor can emit.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SbomFormat {
    /// CycloneDX 1.4 JSON.
    CycloneDx,
    /// SPDX 2.3 JSON.
    Spdx,
}

impl FromStr for SbomFormat {
    type Err = SbomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cyclonedx" => Ok(SbomFormat::CycloneDx),
            "spdx" => Ok(SbomFormat::Spdx),
            other => Err(SbomError::UnknownFormat(other.to_owned())),
        }
    }
}

/// Errors raised while extracting an SBOM.
#[derive(Debug, Error)]
pub enum SbomError {
    /// A blob with package metadata could not be read.
    #[error(transparent)]
    Library(#[from] LibraryError),

    /// Reading package metadata failed.
    #[error("sbom i/o failure")]
    Io(#[from] std::io::Error),

    /// A `conda-meta` record could not be decoded.
    #[error("invalid conda-meta record '{0}'")]
    InvalidCondaMeta(String, #[source] serde_json::Error),

    /// The final document could not be encoded.
    #[error("failed to encode sbom document")]
    Encode(#[source] serde_json::Error),

    /// The requested format is not one of `cyclonedx` / `spdx`.
    #[error("unknown sbom format '{0}'")]
    UnknownFormat(String),
}

/// Extracts the SBOM for `catalog`, reading package metadata from
/// `library`, and renders it in `format`. Repeated calls for the same
/// catalog and format return byte-identical output.
pub fn generate(
    library: &DiskLibrary,
    catalog: &Catalog,
    format: SbomFormat,
) -> Result<String, SbomError> {
    let components = collect_components(library, catalog)?;
    tracing::debug!(
        "collected {} components from catalog {}",
        components.len(),
        catalog.name()
    );
    match format {
        SbomFormat::CycloneDx => cyclonedx_document(catalog, &components),
        SbomFormat::Spdx => spdx_document(catalog, &components),
    }
}
