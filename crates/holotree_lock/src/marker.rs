//! Pid/heartbeat markers written next to every held lock path.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::{LockError, STALE_HEARTBEAT};

/// The payload of a `<path>.pid` marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMarker {
    /// Pid of the process holding (or last holding) the lock.
    pub pid: u32,
    /// Last heartbeat written by the holder.
    pub heartbeat: DateTime<Utc>,
}

impl LockMarker {
    /// Reads and parses a marker file.
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let contents = fs_err::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Serializes this marker to `path`.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let contents = serde_json::to_string(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs_err::write(path, contents)
    }

    /// True when the heartbeat is older than the staleness threshold.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.heartbeat);
        age.to_std()
            .map(|age| age > STALE_HEARTBEAT)
            .unwrap_or(false)
    }
}

/// The marker path adjacent to a locked path.
pub fn marker_path(lock_path: &Path) -> PathBuf {
    let mut name = lock_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".pid");
    lock_path.with_file_name(name)
}

/// Writes a fresh marker for the current process.
pub fn write(lock_path: &Path) -> std::io::Result<()> {
    LockMarker {
        pid: std::process::id(),
        heartbeat: Utc::now(),
    }
    .write(&marker_path(lock_path))
}

/// Removes the marker, but only when it still records this process.
pub fn remove_if_ours(lock_path: &Path) {
    let path = marker_path(lock_path);
    match LockMarker::read(&path) {
        Ok(marker) if marker.pid == std::process::id() => {
            let _ = fs_err::remove_file(&path);
        }
        _ => {}
    }
}

/// Breaks a stale marker left behind by a dead process. A fresh marker, or a
/// stale one whose pid is still alive, is left in place.
pub fn break_if_abandoned(lock_path: &Path) -> Result<(), LockError> {
    let path = marker_path(lock_path);
    let marker = match LockMarker::read(&path) {
        Ok(marker) => marker,
        Err(_) => return Ok(()),
    };
    if !marker.is_stale(Utc::now()) || pid_is_alive(marker.pid) {
        return Ok(());
    }
    tracing::warn!(
        "breaking abandoned lock marker '{}' (pid {} is gone)",
        path.display(),
        marker.pid
    );
    match fs_err::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LockError::Abandoned(path, e)),
    }
}

/// Checks whether a pid refers to a live process on this host.
fn pid_is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
