//! The immutable per-process configuration every component receives.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use holotree_types::Platform;

/// Environment variable overriding the product home directory.
pub const HOME_ENV_VAR: &str = "HOLOTREE_HOME";

/// Options consumed by the storage engine. All optional with defaults; none
/// has partial effects.
#[derive(Debug, Clone)]
pub struct HolotreeOptions {
    /// Store blobs raw. Readers accept both forms regardless.
    pub no_compress: bool,
    /// Lay the library out group-writable for multi-user hosts.
    pub shared_holotree: bool,
    /// Fold `dev-dependencies` blocks into blueprint composition.
    pub dev_dependencies: bool,
    /// Record even when the blueprint is already known.
    pub force_build: bool,
    /// Age threshold in days for space/tempfile collection.
    pub cleanup_days: u32,
    /// How long a single lock acquisition attempt may wait.
    pub lock_timeout: Duration,
}

impl Default for HolotreeOptions {
    fn default() -> Self {
        Self {
            no_compress: false,
            shared_holotree: false,
            dev_dependencies: false,
            force_build: false,
            cleanup_days: 30,
            lock_timeout: Duration::from_secs(60),
        }
    }
}

/// The process-wide context: product home, platform tag and options. Built
/// once at startup and passed by reference everywhere; never mutated.
#[derive(Debug, Clone)]
pub struct HolotreeContext {
    home: PathBuf,
    platform: Platform,
    options: HolotreeOptions,
}

impl HolotreeContext {
    /// A context rooted at an explicit home directory.
    pub fn new(home: impl Into<PathBuf>, options: HolotreeOptions) -> Self {
        Self {
            home: home.into(),
            platform: Platform::current(),
            options,
        }
    }

    /// Determines the product home: the `HOLOTREE_HOME` environment variable
    /// when set, otherwise `<local data dir>/holotree`.
    pub fn discover(options: HolotreeOptions) -> std::io::Result<Self> {
        let home = std::env::var(HOME_ENV_VAR).map(PathBuf::from).or_else(|_| {
            dirs::data_local_dir()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "could not determine a data directory for the current platform",
                    )
                })
                .map(|mut p| {
                    p.push("holotree");
                    p
                })
        })?;
        Ok(Self::new(home, options))
    }

    /// The product home directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// The platform catalogs are recorded for and restored on.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// The option set.
    pub fn options(&self) -> &HolotreeOptions {
        &self.options
    }

    /// `<home>/hololib`.
    pub fn hololib_dir(&self) -> PathBuf {
        self.home.join("hololib")
    }

    /// `<home>/hololib/catalogs`, the catalog index directory.
    pub fn catalogs_dir(&self) -> PathBuf {
        self.hololib_dir().join("catalogs")
    }

    /// `<home>/hololib/library`, the sharded blob store root.
    pub fn library_dir(&self) -> PathBuf {
        self.hololib_dir().join("library")
    }

    /// `<home>/hololib/shared.marker`; its presence enables shared mode.
    pub fn shared_marker(&self) -> PathBuf {
        self.hololib_dir().join("shared.marker")
    }

    /// `<home>/spaces`, materialized projections and their `.use` markers.
    pub fn spaces_dir(&self) -> PathBuf {
        self.home.join("spaces")
    }

    /// `<home>/locks`, advisory lock files and pid markers.
    pub fn locks_dir(&self) -> PathBuf {
        self.home.join("locks")
    }

    /// `<home>/tmp`, tempfiles swept by age-based cleanup.
    pub fn tmp_dir(&self) -> PathBuf {
        self.home.join("tmp")
    }

    /// The library root lock path. Readers hold it shared, cleanup and
    /// catalog removal hold it exclusive.
    pub fn library_lock(&self) -> PathBuf {
        self.locks_dir().join("library.lock")
    }

    /// The per-blueprint recording lock path.
    pub fn blueprint_lock(&self, hash: &holotree_types::BlueprintHash) -> PathBuf {
        self.locks_dir().join(format!("blueprint-{hash}.lock"))
    }

    /// The per-space restore lock path.
    pub fn space_lock(&self, identity: &str) -> PathBuf {
        self.locks_dir().join(format!("space-{identity}.lock"))
    }

    /// True when this library is shared between users, either by option or
    /// by an existing `shared.marker`.
    pub fn is_shared(&self) -> bool {
        self.options.shared_holotree || self.shared_marker().is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::{HolotreeContext, HolotreeOptions};

    #[test]
    fn layout_hangs_off_home() {
        let ctx = HolotreeContext::new("/opt/holotree", HolotreeOptions::default());
        assert_eq!(
            ctx.catalogs_dir(),
            std::path::Path::new("/opt/holotree/hololib/catalogs")
        );
        assert_eq!(
            ctx.library_dir(),
            std::path::Path::new("/opt/holotree/hololib/library")
        );
        assert_eq!(ctx.tmp_dir(), std::path::Path::new("/opt/holotree/tmp"));
    }

    #[test]
    fn shared_marker_toggles_shared_mode() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = HolotreeContext::new(dir.path(), HolotreeOptions::default());
        assert!(!ctx.is_shared());
        std::fs::create_dir_all(ctx.hololib_dir()).unwrap();
        std::fs::write(ctx.shared_marker(), "").unwrap();
        assert!(ctx.is_shared());
    }
}
