//! Taste-learning daemon for media players.
//!
//! A thin player-side plugin streams playlist and playback events to this
//! daemon over a local socket (or TCP). The daemon mirrors the player's
//! playlist, resolves every track to a durable song identity in SQLite, and
//! infers artist/title metadata when tags are missing or unreliable.
//!
//! Core modules:
//! - [`server`] - Socket listener, line framing, and the single-threaded event loop
//! - [`protocol`] - Handshake state machine and per-role line dispatch
//! - [`playlist`] - The playlist mirror and its reconciliation rules
//! - [`identity`] - Transactional path-to-identity resolution
//! - [`infer`] - The artist/title inference cascade
//!
//! ### Supporting Modules
//!
//! - [`db`] - SQLite persistence operations
//! - [`selector`] - Next-track selection seam (pluggable scorer)
//! - [`tags`] - Tag-reading seam
//! - [`config`] - State directory and transport configuration
//! - [`cli`] - Command-line interface definitions with clap integration
//! - [`lockfile`] - Single-instance lock
//!
//! ## Protocol Sketch
//!
//! ```text
//! player plugin ──lines──▶ dispatcher ──▶ playlist mirror ──▶ identity pipeline
//!                                │                │
//! monitors ◀───── Refresh ───────┘◀───────────────┘
//! ```
//!
//! Commands are newline-delimited text; the first whitespace-delimited token
//! selects the command, the rest of the line is arguments (paths may contain
//! spaces). A connection's first meaningful command classifies it as either
//! the single player-control client (`IMMS`) or one of many remote monitors
//! (`Remote`); the classification is permanent for the connection's lifetime.
//!
//! ## Error Handling
//!
//! All fallible operations return `Result<T, anyhow::Error>`. Protocol-level
//! problems (unknown commands, malformed arguments) are logged and skipped;
//! they never terminate a connection. Only socket setup failures and a second
//! running instance are fatal.

pub mod cli;
pub mod config;
pub mod db;
pub mod identity;
pub mod infer;
pub mod lockfile;
pub mod playlist;
pub mod protocol;
pub mod selector;
pub mod server;
pub mod tags;
