//! Spaces: writable projections of catalogs, one per controller+name pair.
//!
//! Regular files are hardlinked straight out of the library; when a
//! hardlink is impossible (cross-device target, compressed blob) the file
//! is copied and decompressed instead. Restoring is guarded by a per-space
//! exclusive lock and leaves a `.use` marker only after the projection is
//! complete.

mod templates;

use std::{
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use filetime::FileTime;
use holotree_digest::{compute_bytes_digest, Sha256};
use holotree_lock::{acquire, LockError, LockMode};
use holotree_types::BlueprintHash;
use serde::{Deserialize, Serialize};

use crate::{
    cancel::{CancelToken, Cancelled},
    catalog::{Catalog, FileEntry},
    context::HolotreeContext,
    library::{DiskLibrary, LibraryError},
    scorecard::{Scorecard, ScorecardPhase, StepStatus},
};

pub use templates::{is_activation_file, TemplateVars};

/// Errors raised while restoring or managing spaces.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    /// The library refused an operation (missing catalog or blob, corrupt
    /// blob, lock trouble inside the library).
    #[error(transparent)]
    Library(#[from] LibraryError),

    /// The space lock could not be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Filesystem trouble in the space directory.
    #[error("space i/o failure")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    /// No space exists for the requested identity.
    #[error("no space recorded for identity {identity}")]
    UnknownSpace {
        /// The requested space identity.
        identity: String,
    },
}

/// The identity of a space: hex SHA-256 of `controller || "\x00" || space`.
pub fn space_identity(controller: &str, space: &str) -> String {
    let mut bytes = Vec::with_capacity(controller.len() + space.len() + 1);
    bytes.extend_from_slice(controller.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(space.as_bytes());
    let digest = compute_bytes_digest::<Sha256>(&bytes);
    format!("{digest:x}")
}

/// First 16 hex chars of the SHA-256 of a single component, used for the
/// two-level space directory layout.
fn short_hash(value: &str) -> String {
    let digest = compute_bytes_digest::<Sha256>(value.as_bytes());
    format!("{digest:x}")[..16].to_owned()
}

/// The payload of a `<identity>.use` marker. The file's mtime is the last
/// use; the payload binds the space to its blueprint and names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UseMarker {
    /// The blueprint the space was restored from.
    pub blueprint: BlueprintHash,
    /// The controller that requested the space.
    pub controller: String,
    /// The space name within the controller.
    pub space: String,
}

/// A listed space.
#[derive(Debug, Clone, Serialize)]
pub struct SpaceInfo {
    /// The space identity (marker file stem).
    pub identity: String,
    /// The controller that requested the space.
    pub controller: String,
    /// The space name within the controller.
    pub space: String,
    /// The blueprint the space was restored from.
    pub blueprint: BlueprintHash,
    /// The materialized directory.
    pub path: PathBuf,
    /// Last use, from the marker mtime.
    pub last_use: DateTime<Utc>,
}

/// Materializes catalogs into per-controller spaces and tracks their use.
pub struct SpaceManager {
    context: Arc<HolotreeContext>,
}

impl SpaceManager {
    /// A manager over the context's `spaces/` directory.
    pub fn new(context: Arc<HolotreeContext>) -> Self {
        SpaceManager { context }
    }

    /// The directory a controller+space pair materializes into.
    pub fn space_dir(&self, controller: &str, space: &str) -> PathBuf {
        self.context
            .spaces_dir()
            .join(short_hash(controller))
            .join(short_hash(space))
    }

    fn marker_path(&self, identity: &str) -> PathBuf {
        self.context.spaces_dir().join(format!("{identity}.use"))
    }

    /// Projects the catalog for `hash` into the space for
    /// `controller`+`space`. When the space already holds this blueprint the
    /// use marker is touched and nothing else happens.
    pub fn restore(
        &self,
        library: &DiskLibrary,
        hash: &BlueprintHash,
        controller: &str,
        space: &str,
        scorecard: &Scorecard,
        cancel: &CancelToken,
    ) -> Result<PathBuf, RestoreError> {
        cancel.check()?;
        let identity = space_identity(controller, space);
        let target = self.space_dir(controller, space);
        let marker_path = self.marker_path(identity.as_str());

        let _space_lock = acquire(
            &self.context.space_lock(&identity),
            LockMode::Exclusive,
            self.context.options().lock_timeout,
        )?;

        // Fast path: the space already holds this blueprint.
        if target.is_dir() {
            if let Ok(marker) = read_marker(&marker_path) {
                if marker.blueprint == *hash {
                    tracing::debug!(
                        "space {identity} already holds {hash}, touching use marker"
                    );
                    touch(&marker_path)?;
                    return Ok(target);
                }
            }
        }

        scorecard.post(
            ScorecardPhase::Restore,
            0,
            StepStatus::Started,
            format!("restoring {hash} into '{}'", target.display()),
        );

        let catalog = library.load_catalog(hash)?;

        // A failed or interrupted restore must not leave a marker behind.
        match fs_err::remove_file(&marker_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if target.is_dir() {
            fs_err::remove_dir_all(&target)?;
        }
        fs_err::create_dir_all(&target)?;

        self.project(library, &catalog, &target, cancel)?;

        let marker = UseMarker {
            blueprint: hash.clone(),
            controller: controller.to_owned(),
            space: space.to_owned(),
        };
        fs_err::write(
            &marker_path,
            serde_json::to_vec(&marker)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
        )?;
        touch(&marker_path)?;

        scorecard.post(
            ScorecardPhase::Restore,
            0,
            StepStatus::Completed,
            target.display().to_string(),
        );
        Ok(target)
    }

    /// Walks the catalog in deterministic order and links every entry into
    /// `target`.
    fn project(
        &self,
        library: &DiskLibrary,
        catalog: &Catalog,
        target: &Path,
        cancel: &CancelToken,
    ) -> Result<(), RestoreError> {
        let vars = TemplateVars::for_space(target, self.context.platform());
        catalog.treetop::<RestoreError>(&mut |dir_path, dir| {
            cancel.check()?;
            let dir_target = target.join(dir_path);
            fs_err::create_dir_all(&dir_target)?;
            for (name, entry) in &dir.files {
                cancel.check()?;
                let relative = dir_path.join(name);
                let destination = dir_target.join(name);
                if let Some(link_target) = &entry.symlink {
                    recreate_symlink(link_target, &destination)?;
                } else if let Some(digest) = &entry.digest {
                    self.place_file(library, digest, entry, &relative, &destination, &vars)?;
                }
            }
            Ok(())
        })
    }

    /// Places one regular file: templated activation files are rendered,
    /// everything else is hardlinked from the library with a copy fallback.
    fn place_file(
        &self,
        library: &DiskLibrary,
        digest: &str,
        entry: &FileEntry,
        relative: &Path,
        destination: &Path,
        vars: &TemplateVars,
    ) -> Result<(), RestoreError> {
        library.check_blob(digest)?;

        if is_activation_file(relative) {
            let mut content = String::new();
            library.open(digest)?.read_to_string(&mut content)?;
            fs_err::write(destination, vars.substitute(&content))?;
        } else {
            let hardlinkable = !library.is_blob_compressed(digest)?;
            let mut linked = false;
            if hardlinkable {
                match fs_err::hard_link(library.blob_path(digest), destination) {
                    Ok(()) => linked = true,
                    Err(err) => {
                        tracing::debug!(
                            "hardlink of {digest} into '{}' failed ({err}), copying instead",
                            destination.display()
                        );
                    }
                }
            }
            if !linked {
                let mut reader = library.open(digest)?;
                let mut writer = fs_err::File::create(destination)?;
                std::io::copy(&mut reader, &mut writer)?;
            }
        }

        apply_mode(destination, entry)?;
        let midnight = entry
            .mtime
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc();
        filetime::set_file_mtime(
            destination,
            FileTime::from_unix_time(midnight.timestamp(), 0),
        )?;
        Ok(())
    }

    /// Enumerates all known spaces from their `.use` markers.
    pub fn spaces(&self) -> Result<Vec<SpaceInfo>, RestoreError> {
        let spaces_dir = self.context.spaces_dir();
        if !spaces_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut infos = Vec::new();
        for entry in fs_err::read_dir(&spaces_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(identity) = name.strip_suffix(".use") else {
                continue;
            };
            let marker = match read_marker(&entry.path()) {
                Ok(marker) => marker,
                Err(err) => {
                    tracing::warn!("skipping unreadable use marker '{name}': {err}");
                    continue;
                }
            };
            let last_use = entry
                .metadata()?
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            infos.push(SpaceInfo {
                identity: identity.to_owned(),
                path: self.space_dir(&marker.controller, &marker.space),
                controller: marker.controller,
                space: marker.space,
                blueprint: marker.blueprint,
                last_use,
            });
        }
        infos.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(infos)
    }

    /// Deletes the space for a controller+name pair under its lock.
    pub fn delete(&self, controller: &str, space: &str) -> Result<(), RestoreError> {
        let identity = space_identity(controller, space);
        let _space_lock = acquire(
            &self.context.space_lock(&identity),
            LockMode::Exclusive,
            self.context.options().lock_timeout,
        )?;
        let target = self.space_dir(controller, space);
        let marker = self.marker_path(&identity);
        if !target.is_dir() && !marker.is_file() {
            return Err(RestoreError::UnknownSpace { identity });
        }
        if target.is_dir() {
            fs_err::remove_dir_all(&target)?;
        }
        match fs_err::remove_file(&marker) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!("deleted space {identity} ('{controller}'/'{space}')");
        Ok(())
    }
}

fn read_marker(path: &Path) -> std::io::Result<UseMarker> {
    let contents = fs_err::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn touch(path: &Path) -> std::io::Result<()> {
    filetime::set_file_mtime(path, FileTime::now())
}

#[cfg(unix)]
fn recreate_symlink(link_target: &Path, destination: &Path) -> std::io::Result<()> {
    match fs_err::remove_file(destination) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(link_target, destination)
}

#[cfg(windows)]
fn recreate_symlink(link_target: &Path, destination: &Path) -> std::io::Result<()> {
    match fs_err::remove_file(destination) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    // Symlink creation needs a privilege most Windows users lack; a missing
    // link is survivable, a failed restore is not.
    if let Err(err) = std::os::windows::fs::symlink_file(link_target, destination) {
        tracing::warn!(
            "could not recreate symlink '{}' -> '{}': {err}",
            destination.display(),
            link_target.display()
        );
    }
    Ok(())
}

#[cfg(unix)]
fn apply_mode(path: &Path, entry: &FileEntry) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut mode = entry.mode & 0o7777;
    if entry.executable {
        mode |= 0o111;
    }
    fs_err::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(windows)]
fn apply_mode(path: &Path, entry: &FileEntry) -> std::io::Result<()> {
    use std::os::windows::ffi::OsStrExt;

    use windows_sys::Win32::Storage::FileSystem::{
        GetFileAttributesW, SetFileAttributesW, FILE_ATTRIBUTE_HIDDEN,
        INVALID_FILE_ATTRIBUTES,
    };

    if entry.mode & 0o222 == 0 {
        let mut permissions = fs_err::metadata(path)?.permissions();
        permissions.set_readonly(true);
        fs_err::set_permissions(path, permissions)?;
    }
    if entry.hidden {
        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        // SAFETY: `wide` is a valid, NUL-terminated UTF-16 path buffer.
        unsafe {
            let attributes = GetFileAttributesW(wide.as_ptr());
            if attributes != INVALID_FILE_ATTRIBUTES {
                SetFileAttributesW(wide.as_ptr(), attributes | FILE_ATTRIBUTE_HIDDEN);
            }
        }
    }
    Ok(())
}
