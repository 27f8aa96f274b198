//! Single-pass lock file
//!
//! Only one convergence pass may run per node. The lock is a file created
//! with `create_new`; it is removed when the [`PassLock`] is dropped. A pass
//! killed by a reboot leaves its lock behind, so a lock whose holder is no
//! longer running, or that is older than the stale threshold, is taken over.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Held pass lock; released on drop
#[derive(Debug)]
pub struct PassLock {
    path: PathBuf,
}

impl PassLock {
    /// Try to take the lock. Returns `None` if another live pass holds it.
    ///
    /// `holder_alive` reports whether the process recorded in an existing
    /// lock can still be running.
    pub fn try_acquire(
        path: &Path,
        stale_after: Duration,
        holder_alive: &dyn Fn(&LockInfo) -> bool,
    ) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| lock_error(parent, &e))?;
        }

        let mut took_over = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    let content = toml::to_string(&info).map_err(|e| lock_error(path, &e))?;
                    file.write_all(content.as_bytes())
                        .map_err(|e| lock_error(path, &e))?;
                    log::debug!("Acquired pass lock {}", path.display());
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if took_over || !Self::is_stale(path, stale_after, holder_alive) {
                        return Ok(None);
                    }
                    log::warn!("Removing stale pass lock {}", path.display());
                    fs::remove_file(path).map_err(|e| lock_error(path, &e))?;
                    took_over = true;
                }
                Err(e) => return Err(lock_error(path, &e)),
            }
        }
    }

    /// Read the holder of a lock file, if it exists and parses
    pub fn holder(path: &Path) -> Option<LockInfo> {
        let content = fs::read_to_string(path).ok()?;
        toml::from_str(&content).ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_stale(
        path: &Path,
        stale_after: Duration,
        holder_alive: &dyn Fn(&LockInfo) -> bool,
    ) -> bool {
        let acquired_at = match Self::holder(path) {
            Some(info) if !holder_alive(&info) => {
                log::info!("Pass lock holder pid {} is gone", info.pid);
                return true;
            }
            Some(info) => info.acquired_at,
            // Unreadable lock: fall back to the file's age
            None => match fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(_) => return false,
            },
        };
        (Utc::now() - acquired_at)
            .to_std()
            .is_ok_and(|age| age > stale_after)
    }
}

impl Drop for PassLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::debug!("Failed to remove pass lock {}: {}", self.path.display(), e);
        }
    }
}

/// Best-effort check that `pid` names a running process.
///
/// Only answers "no" where the process table can be read without
/// platform calls (`/proc`); elsewhere every pid counts as running.
pub fn process_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if !proc_root.join("self").exists() {
        return true;
    }
    proc_root.join(pid.to_string()).exists()
}

fn lock_error(path: &Path, err: &dyn std::fmt::Display) -> Error {
    Error::Lock {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn alive(_: &LockInfo) -> bool {
        true
    }

    fn gone(_: &LockInfo) -> bool {
        false
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hpcnode.lock");

        let lock = PassLock::try_acquire(&path, HOUR, &alive).unwrap();
        assert!(lock.is_some());
        assert!(PassLock::try_acquire(&path, HOUR, &alive).unwrap().is_none());

        let holder = PassLock::holder(&path).unwrap();
        assert_eq!(holder.pid, std::process::id());
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hpcnode.lock");

        drop(PassLock::try_acquire(&path, HOUR, &alive).unwrap());
        assert!(!path.exists());
        assert!(PassLock::try_acquire(&path, HOUR, &alive).unwrap().is_some());
    }

    #[test]
    fn test_stale_lock_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hpcnode.lock");
        let old = LockInfo {
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(12),
        };
        fs::write(&path, toml::to_string(&old).unwrap()).unwrap();

        let lock = PassLock::try_acquire(&path, HOUR, &alive).unwrap().unwrap();
        assert_eq!(PassLock::holder(lock.path()).unwrap().pid, std::process::id());
    }

    #[test]
    fn test_lock_of_dead_holder_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hpcnode.lock");
        let fresh = LockInfo {
            pid: 4_000_000,
            acquired_at: Utc::now() - chrono::Duration::minutes(2),
        };
        fs::write(&path, toml::to_string(&fresh).unwrap()).unwrap();

        assert!(PassLock::try_acquire(&path, HOUR, &alive).unwrap().is_none());

        let lock = PassLock::try_acquire(&path, HOUR, &gone).unwrap().unwrap();
        assert_eq!(PassLock::holder(lock.path()).unwrap().pid, std::process::id());
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
