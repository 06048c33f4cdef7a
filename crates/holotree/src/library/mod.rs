//! The content-addressed library: digest-keyed blobs plus the catalog index.
//!
//! Concurrency contract: readers hold the library root lock shared;
//! recording holds an exclusive per-blueprint lock nested inside the shared
//! root lock, so builds for distinct blueprints proceed in parallel while
//! builds for the same blueprint serialize. Catalog deletion takes the root
//! lock exclusively.

mod store;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use holotree_lock::{acquire, LockError, LockGuard, LockMode};
use holotree_types::{Blueprint, BlueprintHash, CatalogName, Platform};
use indexmap::IndexMap;
use rayon::prelude::*;
use serde::Serialize;

use crate::{
    cancel::{CancelToken, Cancelled},
    catalog::{Catalog, CatalogError, FileEntry},
    codec::BlobReader,
    context::HolotreeContext,
    scorecard::{Scorecard, ScorecardPhase, StepStatus},
};

pub use store::StoredBlob;

/// Errors raised by library operations.
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    /// An I/O error in the blob store or catalog index.
    #[error("library i/o failure")]
    Io(#[from] std::io::Error),

    /// A lock could not be acquired or serviced.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A catalog file could not be read, written or validated.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// No catalog exists for the blueprint on this platform.
    #[error("no catalog for blueprint {hash} on {platform}")]
    CatalogNotFound {
        /// The requested blueprint.
        hash: BlueprintHash,
        /// The platform the lookup ran on.
        platform: Platform,
    },

    /// A referenced blob is absent from the store.
    #[error("blob {digest} is not in the library")]
    BlobNotFound {
        /// The missing digest.
        digest: String,
    },

    /// A stored blob no longer hashes to its name. The blob has been
    /// quarantined; catalogs referencing it are unreachable until rebuilt.
    #[error("blob {digest} failed its integrity check, quarantined at '{quarantined}'")]
    Integrity {
        /// The corrupt digest.
        digest: String,
        /// Where the blob was moved.
        quarantined: PathBuf,
    },

    /// A catalog cannot be installed because blobs it references are absent.
    #[error("catalog '{0}' references blobs missing from the library")]
    IncompleteCatalog(String),

    /// The operation was cancelled.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Build/tooling metadata recorded into a catalog.
#[derive(Debug, Clone, Default)]
pub struct RecordMeta {
    /// Versions of the tools that produced the tree.
    pub tool_versions: IndexMap<String, String>,
    /// Shell variables to export on activation.
    pub environment: IndexMap<String, String>,
}

/// One integrity failure found by [`Library::verify`].
#[derive(Debug, Clone, Serialize)]
pub struct VerifyFailure {
    /// The digest that failed (or was missing).
    pub digest: String,
    /// Quarantine location, when the blob existed but was corrupt.
    pub quarantined: Option<PathBuf>,
    /// Catalogs that reference the digest and are now unreachable.
    pub catalogs: Vec<String>,
}

/// Summary of a [`Library::verify`] run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyStats {
    /// Catalogs walked.
    pub catalogs_checked: usize,
    /// Distinct blobs re-hashed.
    pub blobs_checked: usize,
    /// Everything that did not check out.
    pub failures: Vec<VerifyFailure>,
}

/// The library capability set behind a tagged variant: the real on-disk
/// implementation and a no-op used by tests.
pub enum Library {
    /// The real, on-disk library.
    Disk(DiskLibrary),
    /// A library that knows nothing and stores nothing.
    Null(NullLibrary),
}

impl Library {
    /// Opens (and lazily initializes) the on-disk library for a context.
    pub fn disk(context: Arc<HolotreeContext>) -> Result<Self, LibraryError> {
        Ok(Library::Disk(DiskLibrary::new(context)?))
    }

    /// A library for tests that swallows everything.
    pub fn null() -> Self {
        Library::Null(NullLibrary)
    }

    /// True iff a catalog for this blueprint and the current platform exists.
    pub fn has_blueprint(&self, hash: &BlueprintHash) -> bool {
        match self {
            Library::Disk(lib) => lib.has_blueprint(hash),
            Library::Null(_) => false,
        }
    }

    /// Records the tree at `source_root` as the catalog for `blueprint`.
    pub fn record(
        &self,
        blueprint: &Blueprint,
        source_root: &Path,
        meta: RecordMeta,
        scorecard: &Scorecard,
        cancel: &CancelToken,
    ) -> Result<Catalog, LibraryError> {
        match self {
            Library::Disk(lib) => lib.record(blueprint, source_root, meta, scorecard, cancel),
            Library::Null(_) => {
                let mut catalog =
                    Catalog::new(blueprint.hash(), Platform::current());
                catalog.tool_versions = meta.tool_versions;
                catalog.environment = meta.environment;
                Ok(catalog)
            }
        }
    }

    /// Opens a stored blob for reading decompressed bytes.
    pub fn open(&self, digest: &str) -> Result<BlobReader, LibraryError> {
        match self {
            Library::Disk(lib) => lib.open(digest),
            Library::Null(_) => Err(LibraryError::BlobNotFound {
                digest: digest.to_owned(),
            }),
        }
    }

    /// Lists catalog file names in the index, sorted.
    pub fn catalog_names(&self) -> Result<Vec<String>, LibraryError> {
        match self {
            Library::Disk(lib) => lib.catalog_names(),
            Library::Null(_) => Ok(Vec::new()),
        }
    }

    /// Loads the catalog for a blueprint on the current platform.
    pub fn load_catalog(&self, hash: &BlueprintHash) -> Result<Catalog, LibraryError> {
        match self {
            Library::Disk(lib) => lib.load_catalog(hash),
            Library::Null(_) => Err(LibraryError::CatalogNotFound {
                hash: hash.clone(),
                platform: Platform::current(),
            }),
        }
    }

    /// The on-disk implementation, when this is one.
    pub fn as_disk(&self) -> Option<&DiskLibrary> {
        match self {
            Library::Disk(lib) => Some(lib),
            Library::Null(_) => None,
        }
    }
}

/// The real on-disk library rooted at `<home>/hololib`.
pub struct DiskLibrary {
    context: Arc<HolotreeContext>,
    store: store::BlobStore,
}

impl DiskLibrary {
    /// Opens the library, creating the directory layout on first use.
    pub fn new(context: Arc<HolotreeContext>) -> Result<Self, LibraryError> {
        fs_err::create_dir_all(context.catalogs_dir())?;
        fs_err::create_dir_all(context.library_dir())?;
        fs_err::create_dir_all(context.tmp_dir())?;
        if context.options().shared_holotree && !context.shared_marker().is_file() {
            fs_err::write(context.shared_marker(), b"")?;
        }
        let store = store::BlobStore::new(
            context.library_dir(),
            context.tmp_dir(),
            context.options().no_compress,
            context.is_shared(),
        );
        Ok(DiskLibrary { context, store })
    }

    /// The context this library was opened with.
    pub fn context(&self) -> &Arc<HolotreeContext> {
        &self.context
    }

    fn catalog_path(&self, name: &CatalogName) -> PathBuf {
        self.context.catalogs_dir().join(name.to_string())
    }

    fn current_name(&self, hash: &BlueprintHash) -> CatalogName {
        CatalogName::new(hash.clone(), self.context.platform())
    }

    /// True iff a catalog file named for this blueprint and the current
    /// platform exists.
    pub fn has_blueprint(&self, hash: &BlueprintHash) -> bool {
        self.catalog_path(&self.current_name(hash)).is_file()
    }

    /// Loads the catalog for a blueprint under the shared root lock.
    pub fn load_catalog(&self, hash: &BlueprintHash) -> Result<Catalog, LibraryError> {
        let _root = self.lock_root_shared()?;
        self.load_catalog_unlocked(hash)
    }

    fn load_catalog_unlocked(&self, hash: &BlueprintHash) -> Result<Catalog, LibraryError> {
        let path = self.catalog_path(&self.current_name(hash));
        if !path.is_file() {
            return Err(LibraryError::CatalogNotFound {
                hash: hash.clone(),
                platform: self.context.platform(),
            });
        }
        Ok(Catalog::load(&path)?)
    }

    /// Records the tree at `source_root` under an exclusive per-blueprint
    /// lock nested inside the shared root lock. When a catalog for the
    /// blueprint already exists (and force-build is off) the existing
    /// catalog is returned without touching the store.
    pub fn record(
        &self,
        blueprint: &Blueprint,
        source_root: &Path,
        meta: RecordMeta,
        scorecard: &Scorecard,
        cancel: &CancelToken,
    ) -> Result<Catalog, LibraryError> {
        cancel.check()?;
        let hash = blueprint.hash();
        let _root = self.lock_root_shared()?;
        let _blueprint = acquire(
            &self.context.blueprint_lock(&hash),
            LockMode::Exclusive,
            self.context.options().lock_timeout,
        )?;

        if !self.context.options().force_build && self.has_blueprint(&hash) {
            tracing::debug!("blueprint {hash} already recorded, reusing catalog");
            return self.load_catalog_unlocked(&hash);
        }

        scorecard.post(
            ScorecardPhase::Record,
            0,
            StepStatus::Started,
            format!("walking '{}'", source_root.display()),
        );
        let walk = walk_source_tree(source_root)?;
        scorecard.post(
            ScorecardPhase::Record,
            0,
            StepStatus::Completed,
            format!("{} files, {} dirs", walk.files.len(), walk.dirs.len()),
        );

        scorecard.post(
            ScorecardPhase::Record,
            1,
            StepStatus::Started,
            "storing blobs",
        );
        let stored: Vec<(PathBuf, FileEntry)> = walk
            .files
            .par_iter()
            .map(|file| -> Result<(PathBuf, FileEntry), LibraryError> {
                cancel.check()?;
                let blob = self.store.store_file(&file.absolute)?;
                let mut entry =
                    FileEntry::regular(blob.digest, blob.size, file.mode, file.mtime);
                entry.executable = file.executable;
                entry.hidden = file.hidden;
                Ok((file.relative.clone(), entry))
            })
            .collect::<Result<_, _>>()?;
        scorecard.post(
            ScorecardPhase::Record,
            1,
            StepStatus::Completed,
            format!("{} blobs", stored.len()),
        );

        let mut catalog = Catalog::new(hash.clone(), self.context.platform());
        catalog.tool_versions = meta.tool_versions;
        catalog.environment = meta.environment;
        for dir in &walk.dirs {
            catalog.root.ensure_dir(dir);
        }
        for (relative, entry) in stored {
            catalog.root.insert_file(&relative, entry);
        }
        for link in &walk.symlinks {
            catalog.root.insert_file(
                &link.relative,
                FileEntry::symlink(link.target.clone(), link.mode, link.mtime),
            );
        }

        cancel.check()?;
        scorecard.post(
            ScorecardPhase::Record,
            2,
            StepStatus::Started,
            "writing catalog",
        );
        self.write_catalog(&catalog)?;
        scorecard.post(
            ScorecardPhase::Record,
            2,
            StepStatus::Completed,
            catalog.name().to_string(),
        );
        Ok(catalog)
    }

    /// Atomically writes a catalog into the index. Blob installation must
    /// already have happened; a catalog in the index implies its closure.
    fn write_catalog(&self, catalog: &Catalog) -> Result<(), LibraryError> {
        let bytes = catalog.to_bytes()?;
        self.write_catalog_bytes(&catalog.name().to_string(), &bytes)
    }

    fn write_catalog_bytes(&self, name: &str, bytes: &[u8]) -> Result<(), LibraryError> {
        use std::io::Write;
        fs_err::create_dir_all(self.context.tmp_dir())?;
        let temp_file = tempfile::Builder::new().tempfile_in(self.context.tmp_dir())?;
        let (mut file, temp_path) = temp_file.into_parts();
        file.write_all(bytes)?;
        file.flush()?;
        drop(file);
        let path = self.context.catalogs_dir().join(name);
        temp_path.persist(&path).map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Opens a stored blob for reading decompressed bytes.
    pub fn open(&self, digest: &str) -> Result<BlobReader, LibraryError> {
        if !self.store.contains(digest) {
            return Err(LibraryError::BlobNotFound {
                digest: digest.to_owned(),
            });
        }
        Ok(self.store.open(digest)?)
    }

    /// True when a blob is present.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.store.contains(digest)
    }

    /// The on-disk path of a blob (for hardlinking and export).
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.store.path_for_digest(digest)
    }

    /// True when the stored form of a blob is compressed (and therefore
    /// cannot be hardlinked into a space).
    pub fn is_blob_compressed(&self, digest: &str) -> Result<bool, LibraryError> {
        Ok(self.store.is_compressed(digest)?)
    }

    /// Re-hashes a blob; on mismatch quarantines it and errors.
    pub fn check_blob(&self, digest: &str) -> Result<(), LibraryError> {
        if !self.store.contains(digest) {
            return Err(LibraryError::BlobNotFound {
                digest: digest.to_owned(),
            });
        }
        if self.store.check_integrity(digest)? {
            return Ok(());
        }
        let quarantined = self.store.quarantine(digest)?;
        Err(LibraryError::Integrity {
            digest: digest.to_owned(),
            quarantined,
        })
    }

    /// Installs one blob from a reader (used by bundle import). Idempotent.
    pub fn install_blob(&self, reader: impl std::io::Read) -> Result<StoredBlob, LibraryError> {
        Ok(self.store.store_reader(reader)?)
    }

    /// Installs raw catalog bytes under `name`, verifying the name grammar,
    /// the schema version and that every referenced blob is present.
    pub fn install_catalog_bytes(&self, name: &str, bytes: &[u8]) -> Result<(), LibraryError> {
        let parsed: CatalogName = name
            .parse()
            .map_err(CatalogError::Name)?;
        let catalog = Catalog::from_bytes(bytes, Path::new(name))?;
        let missing = catalog
            .digests()
            .into_iter()
            .any(|digest| !self.store.contains(&digest));
        if missing {
            return Err(LibraryError::IncompleteCatalog(name.to_owned()));
        }
        let _blueprint = acquire(
            &self.context.blueprint_lock(&parsed.hash),
            LockMode::Exclusive,
            self.context.options().lock_timeout,
        )?;
        self.write_catalog_bytes(name, bytes)
    }

    /// Reads the raw bytes of a catalog file by name (for export).
    pub fn read_catalog_bytes(&self, name: &str) -> Result<Vec<u8>, LibraryError> {
        let _parsed: CatalogName = name.parse().map_err(CatalogError::Name)?;
        let path = self.context.catalogs_dir().join(name);
        Ok(fs_err::read(path)?)
    }

    /// Loads a catalog by file name.
    pub fn load_catalog_by_name(&self, name: &str) -> Result<Catalog, LibraryError> {
        let _parsed: CatalogName = name.parse().map_err(CatalogError::Name)?;
        Ok(Catalog::load(&self.context.catalogs_dir().join(name))?)
    }

    /// Lists catalog file names in the index, sorted. Names that do not
    /// follow the catalog grammar are an error, never silently skipped.
    pub fn catalog_names(&self) -> Result<Vec<String>, LibraryError> {
        let _root = self.lock_root_shared()?;
        let mut names = Vec::new();
        for entry in fs_err::read_dir(self.context.catalogs_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let _parsed: CatalogName = name.parse().map_err(CatalogError::Name)?;
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Removes a catalog from the index under the exclusive root lock.
    pub fn remove_catalog(&self, name: &str) -> Result<(), LibraryError> {
        let _parsed: CatalogName = name.parse().map_err(CatalogError::Name)?;
        let _root = acquire(
            &self.context.library_lock(),
            LockMode::Exclusive,
            self.context.options().lock_timeout,
        )?;
        fs_err::remove_file(self.context.catalogs_dir().join(name))?;
        Ok(())
    }

    /// Walks every catalog, re-hashes every referenced blob, quarantines
    /// mismatches and reports what was found.
    pub fn verify(&self, cancel: &CancelToken) -> Result<VerifyStats, LibraryError> {
        let _root = self.lock_root_shared()?;
        let mut stats = VerifyStats::default();
        let mut blob_owners: std::collections::BTreeMap<String, Vec<String>> =
            std::collections::BTreeMap::new();

        for name in self.catalog_names()? {
            cancel.check()?;
            let catalog = self.load_catalog_by_name(&name)?;
            stats.catalogs_checked += 1;
            for digest in catalog.digests() {
                blob_owners.entry(digest).or_default().push(name.clone());
            }
        }

        for (digest, catalogs) in blob_owners {
            cancel.check()?;
            stats.blobs_checked += 1;
            if !self.store.contains(&digest) {
                stats.failures.push(VerifyFailure {
                    digest,
                    quarantined: None,
                    catalogs,
                });
                continue;
            }
            if !self.store.check_integrity(&digest)? {
                let quarantined = self.store.quarantine(&digest)?;
                stats.failures.push(VerifyFailure {
                    digest,
                    quarantined: Some(quarantined),
                    catalogs,
                });
            }
        }
        Ok(stats)
    }

    fn lock_root_shared(&self) -> Result<LockGuard, LockError> {
        acquire(
            &self.context.library_lock(),
            LockMode::Shared,
            self.context.options().lock_timeout,
        )
    }
}

/// The no-op library used by tests: it knows nothing and stores nothing.
pub struct NullLibrary;

/// One regular file found while walking a source tree.
struct WalkedFile {
    relative: PathBuf,
    absolute: PathBuf,
    mode: u32,
    mtime: chrono::NaiveDate,
    executable: bool,
    hidden: bool,
}

/// One symlink found while walking a source tree.
struct WalkedSymlink {
    relative: PathBuf,
    target: PathBuf,
    mode: u32,
    mtime: chrono::NaiveDate,
}

struct SourceWalk {
    dirs: Vec<PathBuf>,
    files: Vec<WalkedFile>,
    symlinks: Vec<WalkedSymlink>,
}

fn walk_source_tree(root: &Path) -> Result<SourceWalk, LibraryError> {
    let mut walk = SourceWalk {
        dirs: Vec::new(),
        files: Vec::new(),
        symlinks: Vec::new(),
    };
    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.path() == root {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        let mtime = mtime_day(&metadata);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            walk.dirs.push(relative);
        } else if file_type.is_symlink() {
            let target = fs_err::read_link(entry.path())?;
            walk.symlinks.push(WalkedSymlink {
                relative,
                target,
                mode: mode_of(&metadata),
                mtime,
            });
        } else {
            let (executable, hidden) = platform_flags(entry.path(), &metadata);
            walk.files.push(WalkedFile {
                relative,
                absolute: entry.path().to_path_buf(),
                mode: mode_of(&metadata),
                mtime,
                executable,
                hidden,
            });
        }
    }
    Ok(walk)
}

/// Modification time truncated to the day.
fn mtime_day(metadata: &std::fs::Metadata) -> chrono::NaiveDate {
    metadata
        .modified()
        .map(|time| DateTime::<Utc>::from(time).date_naive())
        .unwrap_or_else(|_| Utc::now().date_naive())
}

#[cfg(unix)]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(windows)]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    }
}

#[cfg(unix)]
fn platform_flags(_path: &Path, metadata: &std::fs::Metadata) -> (bool, bool) {
    use std::os::unix::fs::PermissionsExt;
    (metadata.permissions().mode() & 0o111 != 0, false)
}

#[cfg(windows)]
fn platform_flags(path: &Path, metadata: &std::fs::Metadata) -> (bool, bool) {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    let executable = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("exe" | "bat" | "cmd" | "ps1")
    );
    let hidden = metadata.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0;
    (executable, hidden)
}
