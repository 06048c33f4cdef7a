#![deny(missing_docs)]

//! Bundles: single-file ZIP containers packaging catalogs, their blobs,
//! conda recipes and optionally a robot project tree.
//!
//! A bundle may be a plain ZIP or an "appended ZIP": an arbitrary byte
//! prefix (for example a launcher script stub) followed by a valid archive.
//! [`reader::open_bundle`] discovers the embedded archive either way.
//!
//! Layout inside the archive:
//!
//! ```text
//! envs/<name>/conda.yaml            # one or more recipes
//! hololib/hololib.zip               # optional embedded library+catalogs
//! robot/...                         # optional project tree
//! catalogs/<name>                   # library exports
//! library/<aa>/<bb>/<digest>        # blob payloads (decompressed form)
//! ```

pub mod export;
pub mod import;
pub mod reader;
pub mod run;

use std::path::PathBuf;

use holotree::{
    build::BuildError, library::LibraryError, space::RestoreError, Cancelled,
};
use holotree_lock::LockError;
use holotree_types::RecipeError;

/// Errors raised by bundle operations.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// The bundle file could not be read or written.
    #[error("bundle i/o failure")]
    Io(#[from] std::io::Error),

    /// The archive is damaged or not a ZIP at all.
    #[error("invalid bundle archive")]
    Zip(#[from] zip::result::ZipError),

    /// No embedded archive could be discovered in the file.
    #[error("'{0}' does not contain a zip archive")]
    NotABundle(PathBuf),

    /// An entry tried to escape the extraction root.
    #[error("bundle entry '{0}' escapes the destination root")]
    PathTraversal(String),

    /// A blob payload does not hash to the digest it is named for.
    #[error("bundle blob '{name}' hashes to {actual}, not its recorded digest")]
    DigestMismatch {
        /// The entry name inside the bundle.
        name: String,
        /// What the payload actually hashes to.
        actual: String,
    },

    /// The library refused an operation during import/export.
    #[error(transparent)]
    Library(#[from] LibraryError),

    /// A lock could not be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A recipe inside the bundle is invalid.
    #[error(transparent)]
    Recipe(#[from] RecipeError),

    /// Building an environment from the bundle failed.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Restoring a space for a bundle environment failed.
    #[error(transparent)]
    Restore(#[from] RestoreError),

    /// The operation was cancelled.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}
