//! # Protocol Dispatcher
//!
//! Per-connection handshake state machine and per-role line dispatch.
//! A fresh connection is unclassified; its first meaningful command decides
//! what it is for the rest of its life:
//!
//! - `IMMS` - the player-control client. At most one player state exists
//!   process-wide; a second `IMMS` connection is logged and routed to the
//!   existing state rather than getting one of its own.
//! - `Remote` - a monitor. Registered in the fan-out list and immediately
//!   sent a `Refresh`.
//! - `Version` - answered in place without consuming the handshake slot.
//!
//! Once classified, every subsequent line goes verbatim to the role's
//! handler; the dispatcher takes no further part. The [`Daemon`] struct is
//! the shared application context the whole process hangs off: it owns the
//! connections, the optional player state, the monitor list, the database
//! handle and the collaborator seams, and it only ever runs on the event
//! loop thread.

use log::{debug, error, info, warn};
use rusqlite::Connection;
use std::collections::HashMap;
use std::io::Write;

use crate::config::INTERFACE_VERSION;
use crate::db;
use crate::playlist::Synchronizer;
use crate::selector::Chooser;
use crate::server::Event;
use crate::tags::TagReader;

/// Identifies one accepted connection for its lifetime.
pub type ConnId = u64;

/// Terminal classification of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Player,
    Monitor,
}

struct Peer {
    writer: Box<dyn Write + Send>,
    role: Option<Role>,
}

/// Shared application context, owned by the event loop thread.
pub struct Daemon {
    peers: HashMap<ConnId, Peer>,
    /// At most one player state exists, by construction.
    player: Option<Synchronizer>,
    monitors: Vec<ConnId>,
    conn: Connection,
    tag_reader: Box<dyn TagReader>,
    chooser: Box<dyn Chooser>,
    shutdown: bool,
}

impl Daemon {
    pub fn new(conn: Connection, tag_reader: Box<dyn TagReader>, chooser: Box<dyn Chooser>) -> Self {
        Self {
            peers: HashMap::new(),
            player: None,
            monitors: Vec::new(),
            conn,
            tag_reader,
            chooser,
            shutdown: false,
        }
    }

    /// True once the daemon has no reason to keep running.
    pub fn should_exit(&self) -> bool {
        self.shutdown
    }

    /// Whether a player-control client is attached.
    pub fn player_attached(&self) -> bool {
        self.player.is_some()
    }

    /// Number of registered monitors.
    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected(id, writer) => self.attach(id, writer),
            Event::Line(id, line) => self.handle_line(id, &line),
            Event::Disconnected(id) => self.detach(id),
        }
    }

    /// Periodic housekeeping, driven by the tick.
    pub fn do_events(&mut self) {
        if let Some(sync) = self.player.as_mut() {
            sync.do_events(&mut self.conn);
        }
    }

    fn attach(&mut self, id: ConnId, writer: Box<dyn Write + Send>) {
        debug!("connection {id} accepted");
        self.peers.insert(id, Peer { writer, role: None });
    }

    fn detach(&mut self, id: ConnId) {
        let Some(peer) = self.peers.remove(&id) else {
            return;
        };
        match peer.role {
            Some(Role::Player) => {
                // Single-player-scoped: without its player the daemon has
                // no purpose. Sync state out and stop the loop.
                info!("player control disconnected, shutting down");
                if let Err(e) = db::flush(&self.conn) {
                    error!("final sync failed: {e:#}");
                }
                self.shutdown = true;
            }
            Some(Role::Monitor) => {
                debug!("monitor {id} disconnected");
                self.monitors.retain(|m| *m != id);
            }
            None => debug!("unclassified connection {id} closed"),
        }
    }

    fn handle_line(&mut self, id: ConnId, line: &str) {
        let Some(role) = self.peers.get(&id).map(|peer| peer.role) else {
            warn!("line from unknown connection {id}");
            return;
        };
        match role {
            None => self.handshake(id, line),
            Some(Role::Player) => self.player_line(id, line),
            Some(Role::Monitor) => self.monitor_line(line),
        }
    }

    fn handshake(&mut self, id: ConnId, line: &str) {
        let command = line.split_whitespace().next().unwrap_or("");
        match command {
            "Version" => self.send(id, &format!("Version {INTERFACE_VERSION}")),
            "IMMS" => {
                if self.player.is_some() {
                    // The existing state keeps running; this connection's
                    // lines will be handled against it.
                    warn!("player control already attached, reusing it for connection {id}");
                } else {
                    info!("player control attached on connection {id}");
                    self.player = Some(Synchronizer::new());
                }
                self.set_role(id, Role::Player);
            }
            "Remote" => {
                self.set_role(id, Role::Monitor);
                self.monitors.push(id);
                self.send(id, "Refresh");
            }
            _ => error!("unknown command: {command}"),
        }
    }

    fn player_line(&mut self, id: ConnId, line: &str) {
        let Some(sync) = self.player.as_mut() else {
            error!("player line without player state: {line}");
            return;
        };
        let outcome = sync.handle_line(&mut self.conn, &*self.tag_reader, &mut *self.chooser, line);

        for reply in &outcome.replies {
            self.send(id, reply);
        }
        if outcome.playlist_updated {
            self.broadcast_refresh();
        }
    }

    fn monitor_line(&mut self, line: &str) {
        let command = line.split_whitespace().next().unwrap_or("");
        match command {
            "Sync" => {
                if self.player.is_some() {
                    info!("forced sync requested by monitor");
                    if let Err(e) = db::flush(&self.conn) {
                        error!("sync failed: {e:#}");
                    }
                } else {
                    debug!("sync requested with no player attached");
                }
            }
            _ => error!("unknown command: {command}"),
        }
    }

    fn set_role(&mut self, id: ConnId, role: Role) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.role = Some(role);
        }
    }

    /// Best-effort push of `Refresh` to every monitor.
    fn broadcast_refresh(&mut self) {
        for id in self.monitors.clone() {
            self.send(id, "Refresh");
        }
    }

    fn send(&mut self, id: ConnId, line: &str) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        let sent = writeln!(peer.writer, "{line}").and_then(|()| peer.writer.flush());
        if let Err(e) = sent {
            // Fire and forget; the reader side will report the disconnect.
            warn!("write to connection {id} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::RatingChooser;
    use crate::tags::NoTags;
    use std::sync::{Arc, Mutex};

    /// Writer whose contents stay observable after being handed to the daemon.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn take_lines(&self) -> Vec<String> {
            let mut buf = self.0.lock().unwrap();
            let text = String::from_utf8_lossy(&buf).into_owned();
            buf.clear();
            text.lines().map(str::to_string).collect()
        }
    }

    fn daemon() -> Daemon {
        Daemon::new(
            db::open_in_memory().expect("db"),
            Box::new(NoTags),
            Box::new(RatingChooser),
        )
    }

    fn connect(daemon: &mut Daemon, id: ConnId) -> SharedBuf {
        let buf = SharedBuf::default();
        daemon.handle_event(Event::Connected(id, Box::new(buf.clone())));
        buf
    }

    fn line(daemon: &mut Daemon, id: ConnId, text: &str) {
        daemon.handle_event(Event::Line(id, text.to_string()));
    }

    #[test]
    fn test_version_does_not_consume_handshake() {
        let mut d = daemon();
        let buf = connect(&mut d, 1);

        line(&mut d, 1, "Version");
        assert_eq!(buf.take_lines(), vec!["Version 2.1"]);
        assert!(!d.player_attached());

        line(&mut d, 1, "IMMS");
        assert!(d.player_attached());
    }

    #[test]
    fn test_unknown_command_keeps_connection_unclassified() {
        let mut d = daemon();
        let buf = connect(&mut d, 1);

        line(&mut d, 1, "Hello there");
        assert!(buf.take_lines().is_empty());

        line(&mut d, 1, "Remote");
        assert_eq!(buf.take_lines(), vec!["Refresh"]);
    }

    #[test]
    fn test_remote_is_refreshed_on_registration() {
        let mut d = daemon();
        let buf = connect(&mut d, 1);

        line(&mut d, 1, "Remote");
        assert_eq!(buf.take_lines(), vec!["Refresh"]);
        assert_eq!(d.monitor_count(), 1);
    }

    #[test]
    fn test_setup_and_select_next_scenario() {
        let mut d = daemon();
        let buf = connect(&mut d, 1);

        line(&mut d, 1, "IMMS");
        line(&mut d, 1, "Setup 1");
        assert_eq!(buf.take_lines(), vec!["ResetSelection"]);

        line(&mut d, 1, "PlaylistEnd");
        line(&mut d, 1, "SelectNext");
        assert_eq!(buf.take_lines(), vec!["TryAgain"]);
    }

    #[test]
    fn test_second_imms_reuses_player_state() {
        let mut d = daemon();
        let first = connect(&mut d, 1);
        let second = connect(&mut d, 2);

        line(&mut d, 1, "IMMS");
        line(&mut d, 1, "Playlist 0 /music/a.mp3");
        assert!(d.player_attached());

        line(&mut d, 2, "IMMS");
        assert!(d.player_attached());

        // The second connection's lines hit the same mirror: a conflicting
        // report for slot 0 is a divergence, not an insert.
        line(&mut d, 2, "PlaylistItem 0 /music/b.mp3");
        assert_eq!(second.take_lines(), vec!["PlaylistChanged"]);
        assert!(first.take_lines().is_empty());
    }

    #[test]
    fn test_monitors_get_refresh_on_playlist_changes() {
        let mut d = daemon();
        let _player = connect(&mut d, 1);
        let monitor = connect(&mut d, 2);

        line(&mut d, 1, "IMMS");
        line(&mut d, 2, "Remote");
        monitor.take_lines();

        line(&mut d, 1, "Playlist 0 /music/a.mp3");
        assert!(monitor.take_lines().is_empty());

        line(&mut d, 1, "PlaylistEnd");
        assert_eq!(monitor.take_lines(), vec!["Refresh"]);
    }

    #[test]
    fn test_monitor_disconnect_leaves_fanout() {
        let mut d = daemon();
        let _player = connect(&mut d, 1);
        let monitor = connect(&mut d, 2);

        line(&mut d, 1, "IMMS");
        line(&mut d, 2, "Remote");
        monitor.take_lines();

        d.handle_event(Event::Disconnected(2));
        assert_eq!(d.monitor_count(), 0);
        assert!(!d.should_exit());

        line(&mut d, 1, "PlaylistEnd");
        assert!(monitor.take_lines().is_empty());
    }

    #[test]
    fn test_player_disconnect_shuts_daemon_down() {
        let mut d = daemon();
        let _player = connect(&mut d, 1);

        line(&mut d, 1, "IMMS");
        assert!(!d.should_exit());

        d.handle_event(Event::Disconnected(1));
        assert!(d.should_exit());
    }

    #[test]
    fn test_unclassified_disconnect_is_harmless() {
        let mut d = daemon();
        let _buf = connect(&mut d, 1);

        d.handle_event(Event::Disconnected(1));
        assert!(!d.should_exit());
    }

    #[test]
    fn test_monitor_sync_is_accepted() {
        let mut d = daemon();
        let _player = connect(&mut d, 1);
        let monitor = connect(&mut d, 2);

        line(&mut d, 1, "IMMS");
        line(&mut d, 2, "Remote");
        monitor.take_lines();

        line(&mut d, 2, "Sync");
        line(&mut d, 2, "Bogus");
        assert!(monitor.take_lines().is_empty());
    }
}
