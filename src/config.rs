//! # Configuration Module
//!
//! Handles the per-user state directory and transport configuration for the
//! daemon. The state directory holds everything the daemon persists:
//!
//! - Linux: `~/.local/share/palate/`
//! - macOS: `~/Library/Application Support/palate/`
//!
//! Inside it live the song database (`palate.db`), the control socket
//! (`socket`), and the single-instance lock (`palated.lock`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Version string reported to clients in reply to the `Version` command.
pub const INTERFACE_VERSION: &str = "2.1";

/// Port used when `--tcp` is given without (or with an unusable) port number.
pub const DEFAULT_TCP_PORT: u16 = 7778;

/// Cadence of the background housekeeping tick.
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Where the daemon listens for its player and monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    /// Unix-domain socket at the given path (the default).
    Unix(PathBuf),
    /// TCP on the given port, bound to all interfaces.
    Tcp(u16),
}

/// Resolved runtime configuration, assembled from CLI flags in `main`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding database, socket and lock file.
    pub state_dir: PathBuf,
    /// Selected listening transport.
    pub transport: Transport,
}

/// Returns the state directory, creating it if necessary.
///
/// An explicit override (from `--data-dir`) wins; otherwise the
/// platform-standard data directory is used.
///
/// # Errors
///
/// Returns an error if the platform data directory cannot be determined or
/// the directory cannot be created.
pub fn state_dir(override_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match override_dir {
        Some(dir) => dir.to_path_buf(),
        None => dirs::data_dir()
            .context("could not determine the system data directory")?
            .join("palate"),
    };

    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create state directory {}", dir.display()))?;

    Ok(dir)
}

/// Path of the song database inside the state directory.
pub fn db_path(state_dir: &Path) -> PathBuf {
    state_dir.join("palate.db")
}

/// Path of the control socket inside the state directory.
pub fn socket_path(state_dir: &Path) -> PathBuf {
    state_dir.join("socket")
}

/// Path of the single-instance lock file inside the state directory.
pub fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join("palated.lock")
}
