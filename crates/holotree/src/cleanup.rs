//! Age-based collection of spaces, tempfiles and quarantined blobs.
//!
//! Cleanup is the only operation that deletes from the product home during
//! normal use, and it runs under the exclusive library root lock.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use holotree_lock::{acquire, LockError, LockMode};
use serde::Serialize;
use walkdir::WalkDir;

use crate::{
    cancel::{CancelToken, Cancelled},
    context::HolotreeContext,
    space::SpaceManager,
};

/// Errors raised during cleanup.
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    /// The exclusive root lock could not be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Cleanup could not enumerate the product home.
    #[error("cleanup i/o failure")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Statistics about one cleanup run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupStats {
    /// Spaces removed (directory plus `.use` marker).
    pub spaces_removed: usize,
    /// Spaces kept because they were used recently enough.
    pub spaces_kept: usize,
    /// Entries removed from `tmp/`.
    pub tempfiles_removed: usize,
    /// Quarantined `.bad` blobs removed from the library.
    pub quarantined_removed: usize,
    /// Stale lock/pid files removed from `locks/`.
    pub lock_files_removed: usize,
    /// Total bytes freed.
    pub bytes_freed: u64,
    /// Paths that could not be removed, with the error text.
    pub failures: Vec<(PathBuf, String)>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

/// Options for one cleanup run.
#[derive(Debug, Clone)]
pub struct CleanupOptions {
    /// Age threshold in days; entries untouched for longer are removed.
    pub limit_days: u32,
    /// Report what would be removed without deleting anything.
    pub dry_run: bool,
}

/// Removes spaces whose `.use` marker is older than the limit, plus aged
/// tempfiles, quarantined blobs and leftover lock files.
pub fn cleanup(
    context: &Arc<HolotreeContext>,
    options: &CleanupOptions,
    cancel: &CancelToken,
) -> Result<CleanupStats, CleanupError> {
    let started = Instant::now();
    let mut stats = CleanupStats::default();
    let cutoff = Duration::from_secs(u64::from(options.limit_days) * 24 * 60 * 60);

    let _root = acquire(
        &context.library_lock(),
        LockMode::Exclusive,
        context.options().lock_timeout,
    )?;

    sweep_spaces(context, options, cutoff, cancel, &mut stats)?;
    sweep_dir(&context.tmp_dir(), options, cutoff, cancel, &mut stats, |s| {
        &mut s.tempfiles_removed
    })?;
    sweep_quarantine(context, options, cutoff, cancel, &mut stats)?;
    sweep_dir(
        &context.locks_dir(),
        options,
        cutoff,
        cancel,
        &mut stats,
        |s| &mut s.lock_files_removed,
    )?;

    stats.duration = started.elapsed();
    tracing::info!(
        "cleanup removed {} spaces, {} tempfiles, {} quarantined blobs ({} bytes)",
        stats.spaces_removed,
        stats.tempfiles_removed,
        stats.quarantined_removed,
        stats.bytes_freed
    );
    Ok(stats)
}

fn sweep_spaces(
    context: &Arc<HolotreeContext>,
    options: &CleanupOptions,
    cutoff: Duration,
    cancel: &CancelToken,
    stats: &mut CleanupStats,
) -> Result<(), CleanupError> {
    let manager = SpaceManager::new(context.clone());
    let spaces = match manager.spaces() {
        Ok(spaces) => spaces,
        Err(err) => {
            tracing::warn!("cleanup could not list spaces: {err}");
            return Ok(());
        }
    };
    for space in spaces {
        cancel.check()?;
        let marker = context.spaces_dir().join(format!("{}.use", space.identity));
        if !is_older_than(&marker, cutoff)? {
            stats.spaces_kept += 1;
            continue;
        }
        let freed = dir_size(&space.path);
        if options.dry_run {
            stats.spaces_removed += 1;
            stats.bytes_freed += freed;
            continue;
        }
        match manager.delete(&space.controller, &space.space) {
            Ok(()) => {
                stats.spaces_removed += 1;
                stats.bytes_freed += freed;
            }
            Err(err) => stats.failures.push((space.path, err.to_string())),
        }
    }
    Ok(())
}

/// Removes aged entries directly under `dir`.
fn sweep_dir(
    dir: &Path,
    options: &CleanupOptions,
    cutoff: Duration,
    cancel: &CancelToken,
    stats: &mut CleanupStats,
    counter: impl Fn(&mut CleanupStats) -> &mut usize,
) -> Result<(), CleanupError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs_err::read_dir(dir)? {
        cancel.check()?;
        let entry = entry?;
        let path = entry.path();
        if !is_older_than(&path, cutoff)? {
            continue;
        }
        let freed = dir_size(&path);
        if options.dry_run {
            *counter(stats) += 1;
            stats.bytes_freed += freed;
            continue;
        }
        let removed = if entry.file_type()?.is_dir() {
            fs_err::remove_dir_all(&path)
        } else {
            fs_err::remove_file(&path)
        };
        match removed {
            Ok(()) => {
                *counter(stats) += 1;
                stats.bytes_freed += freed;
            }
            Err(err) => stats.failures.push((path, err.to_string())),
        }
    }
    Ok(())
}

/// Removes aged `.bad` quarantined blobs anywhere under the library root.
fn sweep_quarantine(
    context: &Arc<HolotreeContext>,
    options: &CleanupOptions,
    cutoff: Duration,
    cancel: &CancelToken,
    stats: &mut CleanupStats,
) -> Result<(), CleanupError> {
    let root = context.library_dir();
    if !root.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
        cancel.check()?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().map(|e| e != "bad").unwrap_or(true)
        {
            continue;
        }
        if !is_older_than(path, cutoff)? {
            continue;
        }
        let freed = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if options.dry_run {
            stats.quarantined_removed += 1;
            stats.bytes_freed += freed;
            continue;
        }
        match fs_err::remove_file(path) {
            Ok(()) => {
                stats.quarantined_removed += 1;
                stats.bytes_freed += freed;
            }
            Err(err) => stats.failures.push((path.to_path_buf(), err.to_string())),
        }
    }
    Ok(())
}

fn is_older_than(path: &Path, cutoff: Duration) -> Result<bool, CleanupError> {
    let modified = match fs_err::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    Ok(age > cutoff)
}

fn dir_size(path: &Path) -> u64 {
    if path.is_file() {
        return fs_err::metadata(path).map(|m| m.len()).unwrap_or(0);
    }
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
