//! Single-instance lock for the daemon.
//!
//! The lock is a small file holding the owning process id. A lock left
//! behind by a dead process is taken over silently; a lock held by a live
//! process means another daemon owns this state directory.

use anyhow::{Context, Result};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

/// Held for the lifetime of the process; the file is removed on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Try to acquire the lock at `path`.
    ///
    /// Returns `Ok(None)` when another live process holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be read or written.
    pub fn acquire(path: &Path) -> Result<Option<Self>> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("failed to read lock file {}", path.display()))?;
            match contents.trim().parse::<i32>() {
                Ok(pid) if process_alive(pid) => {
                    debug!("lock file {} held by live pid {pid}", path.display());
                    return Ok(None);
                }
                Ok(pid) => info!("removing stale lock file (dead pid {pid})"),
                Err(_) => info!("removing unreadable lock file {}", path.display()),
            }
            fs::remove_file(path)
                .with_context(|| format!("failed to remove stale lock {}", path.display()))?;
        }

        fs::write(path, std::process::id().to_string())
            .with_context(|| format!("failed to write lock file {}", path.display()))?;

        Ok(Some(Self {
            path: path.to_path_buf(),
        }))
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Probe a pid with the null signal.
fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
