//! Catalogs: serialized directory-tree snapshots bound to a blueprint.
//!
//! A catalog is written once by the recorder after a successful build and
//! never mutated. Every digest it references must exist in the library; the
//! restorer and the SBOM extractor both consume catalogs through the
//! deterministic [`Catalog::treetop`] walk.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDate, Utc};
use holotree_types::{BlueprintHash, CatalogName, ParseCatalogNameError, Platform, CATALOG_VERSION};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Errors raised while reading or writing catalog files.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The catalog file could not be read or written.
    #[error("failed to access catalog '{0}'")]
    Io(PathBuf, #[source] std::io::Error),

    /// The catalog file is not valid JSON for this schema.
    #[error("failed to decode catalog '{0}'")]
    Deserialize(PathBuf, #[source] serde_json::Error),

    /// The catalog could not be encoded.
    #[error("failed to encode catalog")]
    Serialize(#[source] serde_json::Error),

    /// The catalog was written with a different schema version and must be
    /// rebuilt.
    #[error("catalog '{path}' has schema version {found}, this build requires {expected}")]
    SchemaMismatch {
        /// The offending file.
        path: PathBuf,
        /// The version found in the file.
        found: u32,
        /// The version this build requires.
        expected: u32,
    },

    /// The file name does not follow the catalog name grammar.
    #[error(transparent)]
    Name(#[from] ParseCatalogNameError),
}

/// A file entry in a recorded environment: a regular file (digest present)
/// or a symlink (target present), never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Hex digest of the decompressed content; present iff regular.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Original size in bytes (0 for symlinks).
    pub size: u64,

    /// POSIX mode bits.
    pub mode: u32,

    /// Modification time, preserved only to the day.
    pub mtime: NaiveDate,

    /// Symlink target; present iff this entry is a symlink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink: Option<PathBuf>,

    /// Executable bit as recorded (kept separately for Windows restores).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub executable: bool,

    /// Hidden flag applied on Windows restores.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
}

impl FileEntry {
    /// A regular file entry.
    pub fn regular(digest: String, size: u64, mode: u32, mtime: NaiveDate) -> Self {
        FileEntry {
            digest: Some(digest),
            size,
            mode,
            mtime,
            symlink: None,
            executable: mode & 0o111 != 0,
            hidden: false,
        }
    }

    /// A symlink entry.
    pub fn symlink(target: PathBuf, mode: u32, mtime: NaiveDate) -> Self {
        FileEntry {
            digest: None,
            size: 0,
            mode,
            mtime,
            symlink: Some(target),
            executable: false,
            hidden: false,
        }
    }

    /// True for regular files.
    pub fn is_regular(&self) -> bool {
        self.digest.is_some()
    }

    /// True for symlinks.
    pub fn is_symlink(&self) -> bool {
        self.symlink.is_some()
    }
}

/// One directory level of the snapshot. Maps are ordered so serialization
/// and walks are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dir {
    /// Files directly in this directory, by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileEntry>,

    /// Subdirectories, by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dirs: BTreeMap<String, Dir>,
}

impl Dir {
    /// Returns the subdirectory at `relative`, creating intermediate levels.
    pub fn ensure_dir(&mut self, relative: &Path) -> &mut Dir {
        let mut current = self;
        for component in relative.components() {
            let name = component.as_os_str().to_string_lossy().into_owned();
            current = current.dirs.entry(name).or_default();
        }
        current
    }

    /// Inserts a file entry at `relative`, creating intermediate dirs.
    pub fn insert_file(&mut self, relative: &Path, entry: FileEntry) {
        let parent = relative.parent().unwrap_or_else(|| Path::new(""));
        let name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.ensure_dir(parent).files.insert(name, entry);
    }
}

/// The serialized snapshot of one environment build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Schema version; mismatches are a hard error.
    pub version: u32,

    /// The blueprint this catalog was recorded for.
    pub blueprint: BlueprintHash,

    /// The platform the catalog was recorded on.
    pub platform: Platform,

    /// When the recording happened.
    pub recorded_at: DateTime<Utc>,

    /// Versions of the tools that produced the tree (micromamba, pip, ...).
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub tool_versions: IndexMap<String, String>,

    /// Top-level shell variables to export on activation (PATH,
    /// CONDA_PREFIX, ...).
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, String>,

    /// The recorded directory tree.
    pub root: Dir,
}

impl Catalog {
    /// A fresh catalog shell at the current schema version.
    pub fn new(blueprint: BlueprintHash, platform: Platform) -> Self {
        Catalog {
            version: CATALOG_VERSION,
            blueprint,
            platform,
            recorded_at: Utc::now(),
            tool_versions: IndexMap::new(),
            environment: IndexMap::new(),
            root: Dir::default(),
        }
    }

    /// The file name this catalog is stored under.
    pub fn name(&self) -> CatalogName {
        CatalogName {
            hash: self.blueprint.clone(),
            version: self.version,
            platform: self.platform,
        }
    }

    /// Serializes this catalog to stable, pretty-printed JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CatalogError> {
        let mut bytes =
            serde_json::to_vec_pretty(self).map_err(CatalogError::Serialize)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Loads and validates a catalog file. A schema-version mismatch is a
    /// hard error: the catalog must be rebuilt.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let contents =
            fs_err::read(path).map_err(|e| CatalogError::Io(path.to_path_buf(), e))?;
        Self::from_bytes(&contents, path)
    }

    /// Decodes catalog bytes, naming `path` in errors.
    pub fn from_bytes(contents: &[u8], path: &Path) -> Result<Self, CatalogError> {
        let value: serde_json::Value = serde_json::from_slice(contents)
            .map_err(|e| CatalogError::Deserialize(path.to_path_buf(), e))?;
        let found = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;
        if found != CATALOG_VERSION {
            return Err(CatalogError::SchemaMismatch {
                path: path.to_path_buf(),
                found,
                expected: CATALOG_VERSION,
            });
        }
        serde_json::from_value(value)
            .map_err(|e| CatalogError::Deserialize(path.to_path_buf(), e))
    }

    /// Visits every directory of the snapshot, parents before children,
    /// siblings in sorted-name order.
    pub fn treetop<E>(
        &self,
        visit: &mut dyn FnMut(&Path, &Dir) -> Result<(), E>,
    ) -> Result<(), E> {
        fn walk<E>(
            path: &Path,
            dir: &Dir,
            visit: &mut dyn FnMut(&Path, &Dir) -> Result<(), E>,
        ) -> Result<(), E> {
            visit(path, dir)?;
            for (name, sub) in &dir.dirs {
                walk(&path.join(name), sub, visit)?;
            }
            Ok(())
        }
        walk(Path::new(""), &self.root, visit)
    }

    /// All blob digests this catalog references, deduplicated and sorted.
    pub fn digests(&self) -> BTreeSet<String> {
        let mut digests = BTreeSet::new();
        let _ = self.treetop::<std::convert::Infallible>(&mut |_, dir| {
            digests.extend(dir.files.values().filter_map(|f| f.digest.clone()));
            Ok(())
        });
        digests
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use chrono::NaiveDate;
    use holotree_types::Platform;

    use super::{Catalog, CatalogError, Dir, FileEntry};

    const HASH: &str = "4dd9893f1eee45e1579d1a4f5533ef67a84b5e4b7515de7ed0db1dd47adc6bc8";

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()
    }

    fn sample_catalog() -> Catalog {
        let mut catalog = Catalog::new(HASH.parse().unwrap(), Platform::Linux64);
        catalog.root.insert_file(
            Path::new("bin/python"),
            FileEntry::regular("ab".repeat(32), 9000, 0o755, day()),
        );
        catalog.root.insert_file(
            Path::new("lib/x.so"),
            FileEntry::regular("cd".repeat(32), 512, 0o644, day()),
        );
        catalog.root.insert_file(
            Path::new("lib/link"),
            FileEntry::symlink(PathBuf::from("x.so"), 0o777, day()),
        );
        catalog.root.ensure_dir(Path::new("empty-dir"));
        catalog
    }

    #[test]
    fn round_trips_through_bytes() {
        let catalog = sample_catalog();
        let bytes = catalog.to_bytes().unwrap();
        let reloaded = Catalog::from_bytes(&bytes, Path::new("test")).unwrap();
        assert_eq!(catalog, reloaded);
    }

    #[test]
    fn serialization_is_deterministic() {
        let catalog = sample_catalog();
        assert_eq!(catalog.to_bytes().unwrap(), catalog.to_bytes().unwrap());
    }

    #[test]
    fn schema_mismatch_is_a_hard_error() {
        let mut catalog = sample_catalog();
        catalog.version = 12;
        let bytes = serde_json::to_vec(&catalog).unwrap();
        let err = Catalog::from_bytes(&bytes, Path::new("old")).unwrap_err();
        match err {
            CatalogError::SchemaMismatch {
                found, expected, ..
            } => {
                assert_eq!(found, 12);
                assert_eq!(expected, super::CATALOG_VERSION);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn treetop_visits_sorted_depth_first() {
        let catalog = sample_catalog();
        let mut seen = Vec::new();
        catalog
            .treetop::<std::convert::Infallible>(&mut |path, _| {
                seen.push(path.to_path_buf());
                Ok(())
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![
                PathBuf::from(""),
                PathBuf::from("bin"),
                PathBuf::from("empty-dir"),
                PathBuf::from("lib"),
            ]
        );
    }

    #[test]
    fn digests_are_collected_once() {
        let mut catalog = sample_catalog();
        // Same content under a second name.
        catalog.root.insert_file(
            Path::new("bin/python3"),
            FileEntry::regular("ab".repeat(32), 9000, 0o755, day()),
        );
        let digests = catalog.digests();
        assert_eq!(digests.len(), 2);
    }

    #[test]
    fn entry_kind_helpers() {
        let regular = FileEntry::regular("ab".repeat(32), 1, 0o644, day());
        assert!(regular.is_regular() && !regular.is_symlink());
        let link = FileEntry::symlink(PathBuf::from("x"), 0o777, day());
        assert!(link.is_symlink() && !link.is_regular());
        assert!(!regular.executable);
        let exe = FileEntry::regular("ab".repeat(32), 1, 0o755, day());
        assert!(exe.executable);
    }

    #[test]
    fn catalog_name_matches_grammar() {
        let catalog = sample_catalog();
        let name = catalog.name().to_string();
        assert!(name.starts_with(HASH));
        assert!(name.ends_with(".linux_64"));
    }

    #[test]
    fn empty_dir_survives_round_trip() {
        let catalog = sample_catalog();
        let bytes = catalog.to_bytes().unwrap();
        let reloaded = Catalog::from_bytes(&bytes, Path::new("test")).unwrap();
        assert!(reloaded.root.dirs.contains_key("empty-dir"));
        assert!(reloaded.root.dirs["empty-dir"].files.is_empty());
    }
}
