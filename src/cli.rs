//! # Command-Line Interface Module
//!
//! Defines the daemon's command-line interface using Clap derive macros.
//! The daemon takes no subcommands; the only decisions made on the command
//! line are which transport to listen on and where state lives.
//!
//! ## Examples
//!
//! ```bash
//! palated                  # Unix socket in the per-user state directory
//! palated --tcp            # TCP on the default port 7778
//! palated --tcp 9900       # TCP on an explicit port
//! ```

use clap::Parser;
use log::warn;
use std::path::{Path, PathBuf};

use crate::config::{self, Transport};

/// Main application arguments structure.
#[derive(Parser, Debug)]
#[command(name = "palated")]
#[command(about = "Palate: taste-learning daemon for media players")]
#[command(version)]
pub struct Args {
    /// Listen on a TCP port instead of the per-user Unix socket
    ///
    /// Without a value the default port 7778 is used. A value that is not a
    /// valid port number falls back to the default with a warning rather
    /// than refusing to start.
    #[arg(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "")]
    pub tcp: Option<String>,

    /// Override the state directory (database, socket, lock file)
    ///
    /// Mainly useful for testing and for running several isolated daemons
    /// as different pseudo-users.
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,
}

impl Args {
    /// Resolves the listening transport from the parsed flags.
    pub fn transport(&self, state_dir: &Path) -> Transport {
        match &self.tcp {
            None => Transport::Unix(config::socket_path(state_dir)),
            Some(port) if port.is_empty() => Transport::Tcp(config::DEFAULT_TCP_PORT),
            Some(port) => match port.parse::<u16>() {
                Ok(port) => Transport::Tcp(port),
                Err(_) => {
                    warn!(
                        "bad port number '{port}', using default port {} instead",
                        config::DEFAULT_TCP_PORT
                    );
                    Transport::Tcp(config::DEFAULT_TCP_PORT)
                }
            },
        }
    }
}
