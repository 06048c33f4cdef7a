//! Exporting catalogs and their blobs into a bundle archive.

use std::{collections::BTreeSet, io::Write, path::Path};

use holotree::{catalog::Catalog, library::DiskLibrary, CancelToken};
use holotree_lock::{acquire, LockMode};
use itertools::Itertools;
use zip::write::SimpleFileOptions;

use crate::BundleError;

/// What an export wrote.
#[derive(Debug, Clone, Default)]
pub struct ExportStats {
    /// Catalog files emitted.
    pub catalogs: usize,
    /// Blobs emitted.
    pub blobs: usize,
}

/// Writes `selected` catalogs and every blob they transitively reference
/// into a ZIP at `output`, minus blobs already reachable from `known`
/// catalogs on the receiving side. Runs under the shared library root lock
/// so no recorder interferes.
pub fn export(
    library: &DiskLibrary,
    selected: &[String],
    known: &[String],
    output: &Path,
    cancel: &CancelToken,
) -> Result<ExportStats, BundleError> {
    cancel.check()?;
    let context = library.context();
    let _root = acquire(
        &context.library_lock(),
        LockMode::Shared,
        context.options().lock_timeout,
    )?;

    // Blobs the receiver is assumed to hold already.
    let known: BTreeSet<String> = known.iter().cloned().collect();
    let mut known_digests = BTreeSet::new();
    for name in &known {
        match library.load_catalog_by_name(name) {
            Ok(catalog) => known_digests.extend(catalog.digests()),
            Err(err) => {
                tracing::warn!("known catalog '{name}' is not loadable locally: {err}");
            }
        }
    }

    let mut catalogs = Vec::new();
    let mut digests = BTreeSet::new();
    for name in selected.iter().sorted() {
        if known.contains(name) {
            continue;
        }
        cancel.check()?;
        let bytes = library.read_catalog_bytes(name)?;
        let catalog = Catalog::from_bytes(&bytes, Path::new(name.as_str()))
            .map_err(holotree::library::LibraryError::from)?;
        digests.extend(
            catalog
                .digests()
                .into_iter()
                .filter(|digest| !known_digests.contains(digest)),
        );
        catalogs.push((name.clone(), bytes));
    }

    let mut stats = ExportStats::default();
    let file = fs_err::File::create(output)?.into_parts().0;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().large_file(true);

    for (name, bytes) in &catalogs {
        cancel.check()?;
        writer.start_file(format!("catalogs/{name}"), options)?;
        writer.write_all(bytes)?;
        stats.catalogs += 1;
    }

    // Blob payloads travel in decompressed form; the receiving library
    // re-stores them under its own compression policy.
    for digest in &digests {
        cancel.check()?;
        writer.start_file(
            format!("library/{}/{}/{digest}", &digest[0..2], &digest[2..4]),
            options,
        )?;
        let mut reader = library.open(digest)?;
        std::io::copy(&mut reader, &mut writer)?;
        stats.blobs += 1;
    }

    writer.finish()?;
    tracing::info!(
        "exported {} catalogs and {} blobs to '{}'",
        stats.catalogs,
        stats.blobs,
        output.display()
    );
    Ok(stats)
}
