//! # Playlist Synchronizer
//!
//! Owns the authoritative in-process mirror of the player's playlist and
//! handles every command the player-control client sends. The mirror is a
//! position-to-path map rebuilt from full transfers (`Playlist` ...
//! `PlaylistEnd`) and patched by per-item reports; whenever a report
//! disagrees with what the mirror already recorded, the mirror is treated
//! as stale and the player is asked to resend everything rather than
//! trusting either side.
//!
//! Mirror inserts enqueue their position for background identification,
//! which the periodic tick drains a few items at a time, so a large
//! playlist transfer never stalls the event loop.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use path_absolutize::Absolutize;
use rusqlite::Connection;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use crate::db;
use crate::identity::{self, SongData};
use crate::selector::Chooser;
use crate::tags::TagReader;

/// Playlist slots identified per tick.
const IDENT_BATCH: usize = 16;

/// What a handled line asks the connection layer to do.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Reply lines for the player connection, in order.
    pub replies: Vec<String>,
    /// Whether monitors should be sent a `Refresh`.
    pub playlist_updated: bool,
}

impl Outcome {
    fn reply(line: impl Into<String>) -> Self {
        Self {
            replies: vec![line.into()],
            playlist_updated: false,
        }
    }
}

enum Reconcile {
    Inserted,
    Consistent,
    Diverged,
}

/// Player-control state: the mirror and playback bookkeeping.
#[derive(Default)]
pub struct Synchronizer {
    mirror: BTreeMap<u32, String>,
    /// Set once a full transfer has completed.
    ready: bool,
    use_xidle: bool,
    current: Option<SongData>,
    /// Positions awaiting background identification.
    pending: VecDeque<u32>,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mirrored playlist slots.
    pub fn len(&self) -> usize {
        self.mirror.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirror.is_empty()
    }

    /// Path mirrored at `pos`, if any.
    pub fn item(&self, pos: u32) -> Option<&str> {
        self.mirror.get(&pos).map(String::as_str)
    }

    /// Whether the player asked for external idle detection.
    pub fn uses_xidle(&self) -> bool {
        self.use_xidle
    }

    /// Handle one line from the player-control client.
    ///
    /// Protocol errors never escape: unknown commands and malformed
    /// arguments are logged and dropped, internal failures are logged, and
    /// the returned [`Outcome`] carries whatever should still happen.
    pub fn handle_line(
        &mut self,
        conn: &mut Connection,
        tag_reader: &dyn TagReader,
        chooser: &mut dyn Chooser,
        line: &str,
    ) -> Outcome {
        let (command, args) = line
            .split_once(char::is_whitespace)
            .unwrap_or((line, ""));

        let result = match command {
            "Setup" => self.setup(args),
            "StartSong" => self.start_song(conn, tag_reader, args),
            "EndSong" => self.end_song(conn, chooser, args),
            "PlaylistItem" => self.playlist_item(conn, args),
            "Playlist" => self.playlist_insert(conn, args),
            "PlaylistEnd" => self.playlist_end(),
            "PlaylistChanged" => self.playlist_changed(conn, args),
            "SelectNext" => self.select_next(conn, chooser),
            _ => {
                error!("unknown command: {command}");
                Ok(Outcome::default())
            }
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{command} failed: {e:#}");
                Outcome::default()
            }
        }
    }

    fn setup(&mut self, args: &str) -> Result<Outcome> {
        let Some(use_xidle) = parse_bool(args.trim()) else {
            warn!("malformed Setup argument: {args}");
            return Ok(Outcome::default());
        };
        self.use_xidle = use_xidle;
        Ok(Outcome::reply("ResetSelection"))
    }

    fn start_song(
        &mut self,
        conn: &mut Connection,
        tag_reader: &dyn TagReader,
        args: &str,
    ) -> Result<Outcome> {
        let Some((pos, path)) = parse_pos_path(args) else {
            warn!("malformed StartSong arguments: {args}");
            return Ok(Outcome::default());
        };

        let outcome = self.reconcile_outcome(conn, pos, &path)?;

        let mut data = SongData::new(pos, &path);
        if identity::fetch_song_info(conn, tag_reader, &mut data)? {
            info!(
                "now playing [{pos}] {} - {} (rating {}, identified {})",
                data.artist, data.title, data.rating, data.identified
            );
        } else {
            info!("now playing [{pos}] {path} (not ready)");
        }
        self.current = Some(data);

        Ok(outcome)
    }

    fn end_song(
        &mut self,
        conn: &mut Connection,
        chooser: &mut dyn Chooser,
        args: &str,
    ) -> Result<Outcome> {
        let mut fields = args.split_whitespace();
        let flags = (
            fields.next().and_then(parse_bool),
            fields.next().and_then(parse_bool),
            fields.next().and_then(parse_bool),
        );
        let (Some(finished), Some(jumped), Some(bad)) = flags else {
            warn!("malformed EndSong arguments: {args}");
            return Ok(Outcome::default());
        };

        let Some(data) = self.current.take() else {
            warn!("EndSong with no current song");
            return Ok(Outcome::default());
        };

        if data.uid > 0 {
            if finished && !bad {
                db::touch_last_played(conn, data.uid, identity::unix_now())
                    .context("stamping last played")?;
            }
            chooser.song_ended(data.uid, finished, jumped, bad);
        }
        debug!(
            "song ended [{}] finished={finished} jumped={jumped} bad={bad}",
            data.position
        );
        Ok(Outcome::default())
    }

    fn playlist_item(&mut self, conn: &mut Connection, args: &str) -> Result<Outcome> {
        let Some((pos, path)) = parse_pos_path(args) else {
            warn!("malformed PlaylistItem arguments: {args}");
            return Ok(Outcome::default());
        };
        self.reconcile_outcome(conn, pos, &path)
    }

    fn playlist_insert(&mut self, conn: &mut Connection, args: &str) -> Result<Outcome> {
        let Some((pos, path)) = parse_pos_path(args) else {
            warn!("malformed Playlist arguments: {args}");
            return Ok(Outcome::default());
        };
        self.insert_item(conn, pos, &path)?;
        Ok(Outcome::default())
    }

    fn playlist_end(&mut self) -> Result<Outcome> {
        info!("playlist transfer complete: {} items", self.mirror.len());
        self.ready = true;
        Ok(Outcome {
            replies: Vec::new(),
            playlist_updated: true,
        })
    }

    fn playlist_changed(&mut self, conn: &mut Connection, args: &str) -> Result<Outcome> {
        let length = args.trim().parse::<i64>().unwrap_or(-1);
        info!("player playlist length now {length}, requesting full resend");
        self.invalidate(conn)?;
        Ok(Outcome {
            replies: vec!["GetEntirePlaylist".to_string()],
            playlist_updated: true,
        })
    }

    fn select_next(&mut self, conn: &mut Connection, chooser: &mut dyn Chooser) -> Result<Outcome> {
        if !self.ready {
            debug!("selection requested before playlist is ready");
            return Ok(Outcome::reply("TryAgain"));
        }
        let current = self.current.as_ref().map(|data| data.position);
        match chooser.select_next(conn, current) {
            Some(pos) => Ok(Outcome::reply(format!("EnqueueNext {pos}"))),
            None => Ok(Outcome::reply("TryAgain")),
        }
    }

    /// Reconciliation rule shared by `StartSong` and `PlaylistItem`.
    fn reconcile_outcome(
        &mut self,
        conn: &mut Connection,
        pos: u32,
        path: &str,
    ) -> Result<Outcome> {
        Ok(match self.reconcile(conn, pos, path)? {
            Reconcile::Diverged => Outcome::reply("PlaylistChanged"),
            Reconcile::Inserted => Outcome {
                replies: Vec::new(),
                // An insert after the full transfer is an externally
                // visible playlist change.
                playlist_updated: self.ready,
            },
            Reconcile::Consistent => Outcome::default(),
        })
    }

    fn reconcile(&mut self, conn: &mut Connection, pos: u32, path: &str) -> Result<Reconcile> {
        match self.mirror.get(&pos) {
            Some(recorded) if recorded == path => Ok(Reconcile::Consistent),
            Some(recorded) => {
                // The player's playlist has silently diverged from the
                // mirror. The entry is left alone; the resend will replace
                // everything wholesale.
                error!("playlist diverged at {pos}: {recorded} != {path}");
                Ok(Reconcile::Diverged)
            }
            None => {
                self.insert_item(conn, pos, path)?;
                Ok(Reconcile::Inserted)
            }
        }
    }

    fn insert_item(&mut self, conn: &mut Connection, pos: u32, path: &str) -> Result<()> {
        self.mirror.insert(pos, path.to_string());
        db::playlist_upsert(conn, pos, path).context("persisting playlist slot")?;
        self.pending.push_back(pos);
        Ok(())
    }

    fn invalidate(&mut self, conn: &mut Connection) -> Result<()> {
        self.mirror.clear();
        self.pending.clear();
        self.ready = false;
        self.current = None;
        db::playlist_clear(conn).context("clearing persisted playlist")
    }

    /// Periodic housekeeping: identify a bounded batch of pending slots.
    pub fn do_events(&mut self, conn: &mut Connection) {
        for _ in 0..IDENT_BATCH {
            let Some(pos) = self.pending.pop_front() else {
                break;
            };
            if !self.mirror.contains_key(&pos) {
                continue;
            }
            match identity::identify_playlist_item(conn, pos) {
                Ok(true) => {}
                Ok(false) => debug!("could not identify playlist item {pos}"),
                Err(e) => {
                    error!("identification of {pos} failed: {e:#}");
                    break;
                }
            }
        }
    }
}

fn parse_bool(field: &str) -> Option<bool> {
    match field {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

fn parse_pos_path(args: &str) -> Option<(u32, String)> {
    let (pos, rest) = args.trim_start().split_once(char::is_whitespace)?;
    let pos = pos.parse().ok()?;
    let path = normalize_path(rest);
    (!path.is_empty()).then_some((pos, path))
}

/// Clean a player-reported path: trim, make absolute, collapse `.`/`..`.
pub fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim();
    match Path::new(trimmed).absolutize() {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(_) => trimmed.to_string(),
    }
}
