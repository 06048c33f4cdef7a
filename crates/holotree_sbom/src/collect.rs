//! Component collection: conda-meta records and pip dist-info metadata.

use std::io::Read;

use holotree::{catalog::Catalog, library::DiskLibrary};
use itertools::Itertools;
use serde::Deserialize;

use crate::SbomError;

/// Where a component came from, with the origin-specific detail needed for
/// its package URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentKind {
    /// A conda package; the channel may be empty when unknown.
    Conda {
        /// The channel the package was installed from.
        channel: String,
    },
    /// A pip package.
    Pip,
}

/// One package found in a catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    /// Package name as recorded.
    pub name: String,
    /// Package version.
    pub version: String,
    /// Declared license, when the metadata carries one.
    pub license: Option<String>,
    /// Author, when the metadata carries one (pip only).
    pub author: Option<String>,
    /// Home page, when the metadata carries one.
    pub homepage: Option<String>,
    /// The deterministic package URL.
    pub purl: String,
    /// The origin of the component.
    pub kind: ComponentKind,
}

/// The subset of a `conda-meta/*.json` record the SBOM needs.
#[derive(Debug, Deserialize)]
struct CondaMetaRecord {
    name: String,
    version: String,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// Collects all conda and pip components referenced by `catalog`, sorted by
/// package URL so output is deterministic.
pub fn collect_components(
    library: &DiskLibrary,
    catalog: &Catalog,
) -> Result<Vec<Component>, SbomError> {
    let mut components = Vec::new();

    catalog.treetop::<SbomError>(&mut |path, dir| {
        let dir_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if dir_name == "conda-meta" {
            for (file_name, entry) in &dir.files {
                if !file_name.ends_with(".json") {
                    continue;
                }
                let Some(digest) = &entry.digest else {
                    continue;
                };
                components.push(conda_component(library, file_name, digest)?);
            }
        } else if dir_name.ends_with(".dist-info") {
            if let Some(entry) = dir.files.get("METADATA") {
                if let Some(digest) = &entry.digest {
                    if let Some(component) = pip_component(library, digest)? {
                        components.push(component);
                    }
                }
            }
        }
        Ok(())
    })?;

    Ok(components
        .into_iter()
        .unique_by(|c| c.purl.clone())
        .sorted_by(|a, b| a.purl.cmp(&b.purl))
        .collect())
}

fn read_blob(library: &DiskLibrary, digest: &str) -> Result<Vec<u8>, SbomError> {
    let mut bytes = Vec::new();
    library.open(digest)?.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn conda_component(
    library: &DiskLibrary,
    file_name: &str,
    digest: &str,
) -> Result<Component, SbomError> {
    let bytes = read_blob(library, digest)?;
    let record: CondaMetaRecord = serde_json::from_slice(&bytes)
        .map_err(|e| SbomError::InvalidCondaMeta(file_name.to_owned(), e))?;

    let channel = record
        .channel
        .as_deref()
        .map(channel_name)
        .or_else(|| record.url.as_deref().map(channel_name))
        .unwrap_or_default();

    let purl = if channel.is_empty() {
        format!("pkg:conda/{}@{}", record.name, record.version)
    } else {
        format!("pkg:conda/{channel}/{}@{}", record.name, record.version)
    };
    Ok(Component {
        name: record.name,
        version: record.version,
        license: record.license.filter(|l| !l.is_empty()),
        author: None,
        homepage: None,
        purl,
        kind: ComponentKind::Conda { channel },
    })
}

/// Extracts the channel name from a channel string or full URL, dropping
/// the platform subdirectory when one trails it.
fn channel_name(raw: &str) -> String {
    const PLATFORM_DIRS: &[&str] = &[
        "noarch",
        "linux-64",
        "linux-aarch64",
        "osx-64",
        "osx-arm64",
        "win-64",
    ];
    let trimmed = raw.trim_end_matches('/');
    let mut segments: Vec<&str> = trimmed
        .split('/')
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .collect();
    // A trailing package file name or platform dir is not the channel.
    if segments
        .last()
        .is_some_and(|s| s.ends_with(".conda") || s.ends_with(".tar.bz2"))
    {
        segments.pop();
    }
    if segments
        .last()
        .is_some_and(|s| PLATFORM_DIRS.contains(s))
    {
        segments.pop();
    }
    segments.last().copied().unwrap_or_default().to_owned()
}

/// RFC-822-style header parsing of a pip `METADATA` payload. Only the first
/// occurrence of each interesting header counts; the body is ignored.
fn pip_component(
    library: &DiskLibrary,
    digest: &str,
) -> Result<Option<Component>, SbomError> {
    let bytes = read_blob(library, digest)?;
    let text = String::from_utf8_lossy(&bytes);

    let mut name = None;
    let mut version = None;
    let mut license = None;
    let mut author = None;
    let mut homepage = None;
    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key {
            "Name" if name.is_none() => name = Some(value.to_owned()),
            "Version" if version.is_none() => version = Some(value.to_owned()),
            "License" if license.is_none() => license = Some(value.to_owned()),
            "Author" if author.is_none() => author = Some(value.to_owned()),
            "Home-page" if homepage.is_none() => homepage = Some(value.to_owned()),
            _ => {}
        }
    }

    let (Some(name), Some(version)) = (name, version) else {
        tracing::warn!("dist-info METADATA without Name/Version, skipping");
        return Ok(None);
    };
    let purl = format!("pkg:pypi/{}@{version}", normalize_pip_name(&name));
    Ok(Some(Component {
        name,
        version,
        license,
        author,
        homepage,
        purl,
        kind: ComponentKind::Pip,
    }))
}

/// PEP 503 name normalization: lowercase, runs of `-`, `_`, `.` become `-`.
fn normalize_pip_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !last_dash {
                out.push('-');
            }
            last_dash = true;
        } else {
            out.extend(c.to_lowercase());
            last_dash = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{channel_name, normalize_pip_name};

    #[rstest]
    #[case("https://conda.anaconda.org/conda-forge/linux-64", "conda-forge")]
    #[case("https://conda.anaconda.org/conda-forge/noarch", "conda-forge")]
    #[case(
        "https://conda.anaconda.org/conda-forge/linux-64/numpy-1.24-py310.conda",
        "conda-forge"
    )]
    #[case("conda-forge", "conda-forge")]
    #[case("", "")]
    fn channel_extraction(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(channel_name(raw), expected);
    }

    #[rstest]
    #[case("Robot.Framework", "robot-framework")]
    #[case("typing_extensions", "typing-extensions")]
    #[case("requests", "requests")]
    #[case("A__b..c", "a-b-c")]
    fn pip_name_normalization(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize_pip_name(raw), expected);
    }
}
