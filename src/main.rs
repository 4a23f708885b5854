//! # palated - taste-learning daemon
//!
//! Bootstraps the daemon: logging, command-line flags, the per-user state
//! directory, the single-instance lock, the control socket, then the event
//! loop. Everything interesting happens in the library crate; this file
//! only wires it together and turns setup failures into the documented
//! exit codes:
//!
//! - `0` graceful shutdown, help, version
//! - `1` another instance is already running
//! - `2` state directory or database unavailable
//! - `3`/`4`/`5` socket create / bind / listen failure
//!
//! ## Usage
//!
//! ```bash
//! palated                   # listen on the per-user socket
//! palated --tcp 7778        # listen on TCP instead
//! RUST_LOG=debug palated    # with debug logging
//! ```

use clap::Parser;
use log::{error, info};
use std::process;

use palate::protocol::Daemon;
use palate::selector::RatingChooser;
use palate::tags::FileTags;
use palate::{cli, config, db, lockfile, server};

/// Exit code when another instance holds the lock.
const EXIT_ALREADY_RUNNING: i32 = 1;

/// Exit code for state-directory and database failures.
const EXIT_STATE: i32 = 2;

fn main() {
    // Initialize environment logger; control with RUST_LOG.
    env_logger::init();

    let args = cli::Args::parse();

    let state_dir = match config::state_dir(args.data_dir.as_deref()) {
        Ok(dir) => dir,
        Err(e) => {
            error!("{e:#}");
            process::exit(EXIT_STATE);
        }
    };

    let _lock = match lockfile::InstanceLock::acquire(&config::lock_path(&state_dir)) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            error!("another instance already active - exiting");
            process::exit(EXIT_ALREADY_RUNNING);
        }
        Err(e) => {
            error!("could not take the instance lock: {e:#}");
            process::exit(EXIT_STATE);
        }
    };

    let runtime = config::RuntimeConfig {
        transport: args.transport(&state_dir),
        state_dir,
    };

    let conn = match db::open(&config::db_path(&runtime.state_dir)) {
        Ok(conn) => conn,
        Err(e) => {
            error!("{e:#}");
            process::exit(EXIT_STATE);
        }
    };

    let listener = match server::bind(&runtime.transport) {
        Ok(listener) => listener,
        Err(e) => {
            error!("could not set up the control socket: {e}");
            process::exit(server::setup_exit_code(&e));
        }
    };

    info!(
        "version {} ready, listening on {}",
        env!("CARGO_PKG_VERSION"),
        listener.describe()
    );

    let mut daemon = Daemon::new(conn, Box::new(FileTags), Box::new(RatingChooser));
    if let Err(e) = server::run(listener, &mut daemon) {
        error!("event loop failed: {e:#}");
        process::exit(EXIT_STATE);
    }
}
