#![deny(missing_docs)]

//! Cross-process advisory locks keyed by a filesystem path.
//!
//! Every serialized holotree operation (library root, per-blueprint
//! recording, per-space restore) funnels through [`acquire`]. The lock is
//! backed by an OS advisory lock on the path itself; next to the locked path
//! a `<path>.pid` marker records the owning pid and a heartbeat timestamp so
//! that other processes can tell a held lock from an abandoned one.
//!
//! Within a single process locks are reentrant: a second [`acquire`] for a
//! path this process already holds returns a guard sharing the same OS lock
//! instead of deadlocking on a second file descriptor.

mod marker;

use std::{
    collections::HashMap,
    fmt,
    fmt::{Debug, Formatter},
    fs::File,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use fs4::fs_std::FileExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

pub use marker::LockMarker;

/// How often the heartbeat thread refreshes the pid marker while a lock is
/// held.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A marker whose heartbeat is older than this is a candidate for breaking,
/// provided the recorded pid is no longer alive.
pub const STALE_HEARTBEAT: Duration = Duration::from_secs(120);

/// Backoff between the first failed acquisition attempt and the single retry.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// The sharing mode of a path lock.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum LockMode {
    /// Any number of shared holders may coexist across processes.
    Shared,
    /// A single holder, excluding shared holders in other processes.
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Errors that can occur while acquiring or servicing a path lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock file could not be opened or manipulated.
    #[error("failed to open lock file '{0}'")]
    Open(PathBuf, #[source] std::io::Error),

    /// The OS refused the lock operation.
    #[error("failed to {mode} lock '{path}'")]
    Lock {
        /// Path of the lock file.
        path: PathBuf,
        /// Requested sharing mode.
        mode: LockMode,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The lock could not be acquired within the configured timeout.
    #[error("timed out waiting for {mode} lock on '{path}'")]
    Timeout {
        /// Path of the lock file.
        path: PathBuf,
        /// Requested sharing mode.
        mode: LockMode,
    },

    /// A stale marker was found but could not be broken.
    #[error("abandoned lock marker '{0}' could not be removed")]
    Abandoned(PathBuf, #[source] std::io::Error),

    /// The pid marker could not be written.
    #[error("failed to write lock marker '{0}'")]
    Marker(PathBuf, #[source] std::io::Error),
}

/// The process-wide table of currently held locks, keyed by the locked path.
/// Entries are weak so a released lock disappears on its own.
static HELD_LOCKS: Lazy<Mutex<HashMap<PathBuf, std::sync::Weak<HeldLock>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// A handle to an acquired path lock. The lock is released when the last
/// guard for the path within this process is dropped.
pub struct LockGuard {
    held: Arc<HeldLock>,
}

impl Debug for LockGuard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.held.path)
            .field("mode", &self.held.mode)
            .finish()
    }
}

impl LockGuard {
    /// The path this guard is holding locked.
    pub fn path(&self) -> &Path {
        &self.held.path
    }

    /// The mode the underlying OS lock was taken with.
    pub fn mode(&self) -> LockMode {
        self.held.mode
    }
}

/// The actual held OS lock, shared by every reentrant guard in this process.
struct HeldLock {
    path: PathBuf,
    file: Arc<File>,
    mode: LockMode,
    stop_heartbeat: Arc<AtomicBool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.stop_heartbeat.store(true, Ordering::SeqCst);
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        marker::remove_if_ours(&self.path);
        if let Err(err) = FileExt::unlock(&*self.file) {
            tracing::warn!(
                "failed to release lock on '{}': {err}",
                self.path.display()
            );
        }
        // Only evict our own (now dead) registry entry; another thread may
        // have re-acquired the path in the meantime.
        let mut held = HELD_LOCKS.lock();
        if held
            .get(&self.path)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            held.remove(&self.path);
        }
    }
}

/// Acquires the lock at `path` in the requested mode, waiting at most
/// `timeout` per attempt. A timed-out attempt is retried once after a short
/// backoff before surfacing [`LockError::Timeout`].
///
/// If a stale pid marker (heartbeat older than [`STALE_HEARTBEAT`], recorded
/// pid dead) is found next to the path, the marker is broken before locking.
pub fn acquire(path: &Path, mode: LockMode, timeout: Duration) -> Result<LockGuard, LockError> {
    // Reentrant fast-path: this process already holds the path.
    if let Some(existing) = HELD_LOCKS.lock().get(path).and_then(std::sync::Weak::upgrade) {
        tracing::debug!("reusing in-process lock on '{}'", path.display());
        return Ok(LockGuard { held: existing });
    }

    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent).map_err(|e| LockError::Open(path.to_path_buf(), e))?;
    }

    marker::break_if_abandoned(path)?;

    tracing::debug!("acquiring {mode} lock on '{}'", path.display());
    let mut attempt = 0;
    let file = loop {
        match lock_with_timeout(path, mode, timeout) {
            Ok(file) => break file,
            Err(err @ LockError::Timeout { .. }) => {
                if attempt > 0 {
                    return Err(err);
                }
                attempt += 1;
                tracing::debug!(
                    "lock on '{}' busy, retrying after backoff",
                    path.display()
                );
                std::thread::sleep(RETRY_BACKOFF);
            }
            Err(err) => return Err(err),
        }
    };

    marker::write(path).map_err(|e| LockError::Marker(path.to_path_buf(), e))?;

    let stop_heartbeat = Arc::new(AtomicBool::new(false));
    let heartbeat = spawn_heartbeat(path.to_path_buf(), stop_heartbeat.clone());

    let held = Arc::new(HeldLock {
        path: path.to_path_buf(),
        file,
        mode,
        stop_heartbeat,
        heartbeat: Mutex::new(Some(heartbeat)),
    });
    HELD_LOCKS
        .lock()
        .insert(path.to_path_buf(), Arc::downgrade(&held));

    Ok(LockGuard { held })
}

/// Blocks on the OS lock in a worker thread, giving up after `timeout`.
/// Every attempt opens its own file description, so a worker that acquires
/// the lock after the waiter has given up can release it again without
/// touching a later attempt's lock.
fn lock_with_timeout(
    path: &Path,
    mode: LockMode,
    timeout: Duration,
) -> Result<Arc<File>, LockError> {
    let file = Arc::new(
        std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| LockError::Open(path.to_path_buf(), e))?,
    );

    let (tx, rx) = mpsc::channel::<std::io::Result<()>>();
    let worker_file = Arc::clone(&file);
    std::thread::spawn(move || {
        let result = match mode {
            LockMode::Shared => FileExt::lock_shared(&*worker_file),
            LockMode::Exclusive => FileExt::lock_exclusive(&*worker_file),
        };
        let acquired = result.is_ok();
        if tx.send(result).is_err() && acquired {
            // The waiter timed out; nobody owns this acquisition anymore.
            let _ = FileExt::unlock(&*worker_file);
        }
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(())) => Ok(file),
        Ok(Err(source)) => Err(LockError::Lock {
            path: path.to_path_buf(),
            mode,
            source,
        }),
        Err(_) => Err(LockError::Timeout {
            path: path.to_path_buf(),
            mode,
        }),
    }
}

/// Refreshes the heartbeat timestamp in the pid marker until stopped.
fn spawn_heartbeat(path: PathBuf, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            std::thread::park_timeout(HEARTBEAT_INTERVAL);
            if stop.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = marker::write(&path) {
                tracing::warn!(
                    "failed to refresh lock heartbeat for '{}': {err}",
                    path.display()
                );
            }
        }
    })
}
