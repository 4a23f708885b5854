//! # Song Identity Pipeline
//!
//! Resolves a playlist position to a durable song identity and fills in the
//! metadata the rest of the system wants to know about it. Resolution is
//! transactional: the identity write becomes visible all at once or not at
//! all, and a fetch performs at most one identification pass.

use anyhow::Result;
use log::{debug, info};
use rusqlite::Connection;
use std::fs::File;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::db;
use crate::infer;
use crate::tags::TagReader;

/// Per-fetch aggregate for one playlist slot.
///
/// Constructed for a fetch, filled by the pipeline, discarded once the
/// caller has consumed it. Never persisted directly.
#[derive(Debug, Clone)]
pub struct SongData {
    /// Player-relative playlist position.
    pub position: u32,
    /// Normalized path the player reported for this slot.
    pub path: String,
    /// Durable identity, or a sentinel from [`db`].
    pub uid: i64,
    pub artist: String,
    pub title: String,
    pub rating: i64,
    /// Correlation score, maintained by the scoring collaborator.
    pub relation: i64,
    /// Acoustic similarity score, maintained by the scoring collaborator.
    pub acoustic: f64,
    /// Seconds since the song last played to completion.
    pub last_played: i64,
    /// Whether artist and title are trustworthy.
    pub identified: bool,
}

impl SongData {
    pub fn new(position: u32, path: &str) -> Self {
        Self {
            position,
            path: path.to_string(),
            uid: db::UID_UNRESOLVED,
            artist: String::new(),
            title: String::new(),
            rating: 0,
            relation: 0,
            acoustic: 0.0,
            last_played: 0,
            identified: false,
        }
    }
}

/// Resolve the identity of the playlist slot at `pos` and write it back.
///
/// A readable path gets a durable identity (created on first sighting); an
/// unreadable one is marked with the "checked, unknown" sentinel, which is
/// distinct from "never classified". Returns whether a real identity was
/// obtained.
pub fn identify_playlist_item(conn: &Connection, pos: u32) -> Result<bool> {
    let Some(path) = db::playlist_path(conn, pos)? else {
        debug!("no playlist slot at {pos} to identify");
        return Ok(false);
    };

    let uid = if file_readable(Path::new(&path)) {
        db::ensure_song(conn, &path)?
    } else {
        db::UID_UNKNOWN
    };
    db::playlist_update_identity(conn, pos, uid)?;

    Ok(uid > 0)
}

/// Fill `data` for its playlist position.
///
/// Returns `Ok(false)` when the item is not ready: unreadable file, or an
/// identity that could not be resolved. Neither leaves any partial state;
/// the caller may simply retry on a later sighting.
pub fn fetch_song_info(
    conn: &mut Connection,
    tag_reader: &dyn TagReader,
    data: &mut SongData,
) -> Result<bool> {
    if !file_readable(Path::new(&data.path)) {
        return Ok(false);
    }

    // Settle the identity under a transaction: read, identify at most once,
    // re-read. Dropping the guard on any early exit rolls back.
    let tx = conn.transaction()?;
    let mut uid = db::playlist_identity(&tx, data.position)?.unwrap_or(db::UID_UNRESOLVED);
    if uid <= 0 {
        identify_playlist_item(&tx, data.position)?;
        uid = db::playlist_identity(&tx, data.position)?.unwrap_or(db::UID_UNRESOLVED);
    }
    tx.commit()?;

    if uid <= 0 {
        info!("fetch failed: {}", data.path);
        return Ok(false);
    }
    data.uid = uid;

    let (artist, title) = db::song_info(conn, uid)?;
    data.artist = artist;
    data.title = title;

    if !data.artist.is_empty() && !data.title.is_empty() {
        data.identified = true;
    } else {
        let raw = tag_reader.read_tags(Path::new(&data.path));
        if !raw.artist.is_empty() && !raw.title.is_empty() {
            data.artist = raw.artist;
            data.title = raw.title;
            data.identified = true;
        } else if let Some((artist, title)) = infer::parse_song_info(conn, &data.path, &raw)? {
            db::set_song_info(conn, uid, &artist, &title)?;
            data.artist = artist;
            data.title = title;
            data.identified = true;
        }
    }

    data.rating = db::rating(conn, uid)?;
    data.last_played = unix_now() - db::last_played(conn, uid)?;

    Ok(true)
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn file_readable(path: &Path) -> bool {
    File::open(path).is_ok()
}
