//! Importing bundle archives into the library.
//!
//! Blob installation strictly precedes catalog installation, and each
//! catalog is only moved into place once every blob it references is
//! present, so a catalog visible in the index always has its closure.

use std::{io::Write, path::Path};

use holotree::{library::DiskLibrary, CancelToken};
use holotree_lock::{acquire, LockMode};

use crate::{
    reader::{open_bundle, Bundle},
    BundleError,
};

/// What an import installed.
#[derive(Debug, Clone, Default)]
pub struct ImportStats {
    /// Blobs installed (idempotent re-installs included).
    pub blobs: usize,
    /// Catalogs installed.
    pub catalogs: usize,
}

/// Imports the archive at `path` into the library. The archive may be a
/// library export, a robot bundle with an embedded `hololib/hololib.zip`,
/// or both; appended-ZIP prefixes are handled transparently.
pub fn import(
    library: &DiskLibrary,
    path: &Path,
    cancel: &CancelToken,
) -> Result<ImportStats, BundleError> {
    cancel.check()?;
    let mut bundle = open_bundle(path)?;
    import_bundle(library, &mut bundle, cancel)
}

/// Imports an already opened bundle.
pub fn import_bundle(
    library: &DiskLibrary,
    bundle: &mut Bundle,
    cancel: &CancelToken,
) -> Result<ImportStats, BundleError> {
    let mut stats = ImportStats::default();

    // A robot bundle nests its library export as a single entry; unpack it
    // to a tempfile and recurse.
    if bundle.has_entry("hololib/hololib.zip") {
        let bytes = bundle.read_entry("hololib/hololib.zip")?;
        let mut nested = tempfile::NamedTempFile::new()?;
        nested.write_all(&bytes)?;
        nested.flush()?;
        let inner = import(library, nested.path(), cancel)?;
        stats.blobs += inner.blobs;
        stats.catalogs += inner.catalogs;
    }

    let context = library.context();
    let _root = acquire(
        &context.library_lock(),
        LockMode::Shared,
        context.options().lock_timeout,
    )?;

    // Pass 1: install every blob, collecting catalog payloads on the way.
    let mut catalogs: Vec<(String, Vec<u8>)> = Vec::new();
    bundle.for_each_entry(&mut |name: &str, reader: &mut dyn std::io::Read| {
        cancel.check()?;
        if let Some(digest) = blob_entry_digest(name) {
            let stored = library.install_blob(reader)?;
            if stored.digest != digest {
                return Err(BundleError::DigestMismatch {
                    name: name.to_owned(),
                    actual: stored.digest,
                });
            }
            stats.blobs += 1;
        } else if let Some(catalog_name) = catalog_entry_name(name)? {
            let mut bytes = Vec::new();
            std::io::copy(reader, &mut bytes)?;
            catalogs.push((catalog_name, bytes));
        }
        Ok(())
    })?;

    // Pass 2: catalogs, each validated against the now-complete blob store.
    for (name, bytes) in catalogs {
        cancel.check()?;
        library.install_catalog_bytes(&name, &bytes)?;
        stats.catalogs += 1;
    }

    tracing::info!(
        "imported {} blobs and {} catalogs",
        stats.blobs,
        stats.catalogs
    );
    Ok(stats)
}

/// The digest a `library/<aa>/<bb>/<digest>` entry claims to carry.
fn blob_entry_digest(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("library/")?;
    let digest = rest.rsplit('/').next()?;
    (digest.len() == 64).then_some(digest)
}

/// The catalog file name of a `catalogs/<name>` entry. Nested paths under
/// `catalogs/` are traversal attempts.
fn catalog_entry_name(name: &str) -> Result<Option<String>, BundleError> {
    let Some(rest) = name.strip_prefix("catalogs/") else {
        return Ok(None);
    };
    if rest.is_empty() {
        return Ok(None);
    }
    if rest.contains('/') || rest.contains('\\') || rest.contains("..") {
        return Err(BundleError::PathTraversal(name.to_owned()));
    }
    Ok(Some(rest.to_owned()))
}
