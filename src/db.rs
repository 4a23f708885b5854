//! SQLite persistence operations.
//!
//! Two tables back the daemon:
//!
//! - `library` - one row per sighted song: durable identity (`uid`), the
//!   normalized path it was first sighted at, inferred or tag-derived
//!   artist/title, rating and last-played timestamp. Correlation and
//!   acoustic scores are maintained elsewhere and only read back here.
//! - `playlist` - the persisted shadow of the in-process playlist mirror:
//!   position, path, and the identity resolved for that slot.
//!
//! All functions take a `&Connection` so callers can run them inside a
//! [`rusqlite::Transaction`] where atomicity matters; the transaction
//! guard rolls back on drop and commits only when asked.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Identity sentinel: slot has never been through resolution.
pub const UID_UNRESOLVED: i64 = -1;

/// Identity sentinel: resolution ran and could not produce a record.
pub const UID_UNKNOWN: i64 = -2;

/// Rating given to a song on first sighting.
pub const NEW_SONG_RATING: i64 = 100;

/// Open (creating if needed) the song database at `path`.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("could not open song database {}", path.display()))?;
    conn.query_row("PRAGMA journal_mode=WAL", [], |_row| Ok(()))
        .context("failed to enable WAL")?;
    init_schema(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema, for tests.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("could not open in-memory database")?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS library (
            uid         INTEGER PRIMARY KEY,
            path        TEXT    NOT NULL UNIQUE,
            artist      TEXT    NOT NULL DEFAULT '',
            title       TEXT    NOT NULL DEFAULT '',
            rating      INTEGER NOT NULL DEFAULT 100,
            last_played INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX IF NOT EXISTS library_artist ON library (artist);
         CREATE TABLE IF NOT EXISTS playlist (
            pos  INTEGER PRIMARY KEY,
            path TEXT    NOT NULL,
            uid  INTEGER NOT NULL DEFAULT -1
         );",
    )
    .context("failed to initialize schema")
}

/// Look up the durable identity for a path, if one was ever created.
pub fn uid_for_path(conn: &Connection, path: &str) -> Result<Option<i64>> {
    conn.query_row("SELECT uid FROM library WHERE path = ?1", [path], |row| {
        row.get(0)
    })
    .optional()
    .context("uid lookup failed")
}

/// Identity for a path, created on first sighting.
///
/// A uid, once assigned, is stable for the lifetime of the record.
pub fn ensure_song(conn: &Connection, path: &str) -> Result<i64> {
    if let Some(uid) = uid_for_path(conn, path)? {
        return Ok(uid);
    }
    conn.execute(
        "INSERT INTO library (path, rating) VALUES (?1, ?2)",
        params![path, NEW_SONG_RATING],
    )
    .context("failed to register song")?;
    Ok(conn.last_insert_rowid())
}

/// Record (pos, path) in the persisted playlist shadow, resetting the
/// slot's identity to unresolved.
pub fn playlist_upsert(conn: &Connection, pos: u32, path: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO playlist (pos, path, uid) VALUES (?1, ?2, ?3)",
        params![pos, path, UID_UNRESOLVED],
    )
    .context("playlist upsert failed")?;
    Ok(())
}

/// Drop every persisted playlist slot.
pub fn playlist_clear(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM playlist", [])
        .context("playlist clear failed")?;
    Ok(())
}

/// Path recorded at a playlist position, if any.
pub fn playlist_path(conn: &Connection, pos: u32) -> Result<Option<String>> {
    conn.query_row("SELECT path FROM playlist WHERE pos = ?1", [pos], |row| {
        row.get(0)
    })
    .optional()
    .context("playlist path lookup failed")
}

/// Identity recorded at a playlist position, if the slot exists.
pub fn playlist_identity(conn: &Connection, pos: u32) -> Result<Option<i64>> {
    conn.query_row("SELECT uid FROM playlist WHERE pos = ?1", [pos], |row| {
        row.get(0)
    })
    .optional()
    .context("playlist identity lookup failed")
}

/// Write a resolved (or sentinel) identity back to a playlist slot.
pub fn playlist_update_identity(conn: &Connection, pos: u32, uid: i64) -> Result<()> {
    conn.execute(
        "UPDATE playlist SET uid = ?1 WHERE pos = ?2",
        params![uid, pos],
    )
    .context("playlist identity update failed")?;
    Ok(())
}

/// Positions with a fully resolved identity, with their ratings.
pub fn identified_positions(conn: &Connection) -> Result<Vec<(u32, i64)>> {
    let mut stmt = conn
        .prepare(
            "SELECT p.pos, l.rating FROM playlist p
             JOIN library l ON l.uid = p.uid
             WHERE p.uid > 0
             ORDER BY p.pos",
        )
        .context("identified-positions query failed")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .context("identified-positions scan failed")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("identified-positions row failed")?);
    }
    Ok(out)
}

/// Is this (normalized) artist already in the catalog?
pub fn check_artist(conn: &Connection, artist: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM library WHERE artist = ?1 LIMIT 1",
            [artist],
            |row| row.get(0),
        )
        .optional()
        .context("artist check failed")?;
    Ok(found.is_some())
}

/// Is this (artist, title) pair already in the catalog?
pub fn check_title(conn: &Connection, artist: &str, title: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM library WHERE artist = ?1 AND title = ?2 LIMIT 1",
            params![artist, title],
            |row| row.get(0),
        )
        .optional()
        .context("title check failed")?;
    Ok(found.is_some())
}

/// Persisted (artist, title) for a song; empty strings when never set.
pub fn song_info(conn: &Connection, uid: i64) -> Result<(String, String)> {
    conn.query_row(
        "SELECT artist, title FROM library WHERE uid = ?1",
        [uid],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .context("song info lookup failed")
}

/// Persist inferred (artist, title) for a song.
pub fn set_song_info(conn: &Connection, uid: i64, artist: &str, title: &str) -> Result<()> {
    conn.execute(
        "UPDATE library SET artist = ?1, title = ?2 WHERE uid = ?3",
        params![artist, title, uid],
    )
    .context("song info update failed")?;
    Ok(())
}

/// Current rating of a song.
pub fn rating(conn: &Connection, uid: i64) -> Result<i64> {
    conn.query_row("SELECT rating FROM library WHERE uid = ?1", [uid], |row| {
        row.get(0)
    })
    .context("rating lookup failed")
}

/// Unix timestamp of the last completed playback, 0 if never.
pub fn last_played(conn: &Connection, uid: i64) -> Result<i64> {
    conn.query_row(
        "SELECT last_played FROM library WHERE uid = ?1",
        [uid],
        |row| row.get(0),
    )
    .context("last-played lookup failed")
}

/// Stamp the last completed playback of a song.
pub fn touch_last_played(conn: &Connection, uid: i64, when: i64) -> Result<()> {
    conn.execute(
        "UPDATE library SET last_played = ?1 WHERE uid = ?2",
        params![when, uid],
    )
    .context("last-played update failed")?;
    Ok(())
}

/// Push everything committed so far out of the WAL.
///
/// All writes happen through committed transactions already, so a flush is
/// only a checkpoint, not a correctness requirement.
pub fn flush(conn: &Connection) -> Result<()> {
    conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_row| Ok(()))
        .context("checkpoint failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_is_stable_across_sightings() {
        let conn = open_in_memory().expect("db");

        let first = ensure_song(&conn, "/music/a.mp3").expect("first sighting");
        let second = ensure_song(&conn, "/music/a.mp3").expect("second sighting");
        let other = ensure_song(&conn, "/music/b.mp3").expect("other song");

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(first > 0);
    }

    #[test]
    fn test_new_song_gets_neutral_rating() {
        let conn = open_in_memory().expect("db");

        let uid = ensure_song(&conn, "/music/a.mp3").expect("sighting");

        assert_eq!(rating(&conn, uid).expect("rating"), NEW_SONG_RATING);
    }

    #[test]
    fn test_playlist_slot_roundtrip() {
        let conn = open_in_memory().expect("db");

        playlist_upsert(&conn, 3, "/music/a.mp3").expect("upsert");
        assert_eq!(
            playlist_path(&conn, 3).expect("path"),
            Some("/music/a.mp3".to_string())
        );
        assert_eq!(
            playlist_identity(&conn, 3).expect("identity"),
            Some(UID_UNRESOLVED)
        );

        playlist_update_identity(&conn, 3, 42).expect("update");
        assert_eq!(playlist_identity(&conn, 3).expect("identity"), Some(42));

        // Re-recording the slot resets the identity.
        playlist_upsert(&conn, 3, "/music/b.mp3").expect("upsert");
        assert_eq!(
            playlist_identity(&conn, 3).expect("identity"),
            Some(UID_UNRESOLVED)
        );
    }

    #[test]
    fn test_missing_slot_has_no_identity() {
        let conn = open_in_memory().expect("db");

        assert_eq!(playlist_identity(&conn, 9).expect("identity"), None);
        assert_eq!(playlist_path(&conn, 9).expect("path"), None);
    }

    #[test]
    fn test_catalog_checks() {
        let conn = open_in_memory().expect("db");

        let uid = ensure_song(&conn, "/music/a.mp3").expect("sighting");
        set_song_info(&conn, uid, "artist name", "song title").expect("info");

        assert!(check_artist(&conn, "artist name").expect("check"));
        assert!(!check_artist(&conn, "somebody else").expect("check"));
        assert!(check_title(&conn, "artist name", "song title").expect("check"));
        assert!(!check_title(&conn, "artist name", "another title").expect("check"));
    }

    #[test]
    fn test_identified_positions_skips_sentinels() {
        let conn = open_in_memory().expect("db");

        let uid = ensure_song(&conn, "/music/a.mp3").expect("sighting");
        playlist_upsert(&conn, 0, "/music/a.mp3").expect("upsert");
        playlist_upsert(&conn, 1, "/music/gone.mp3").expect("upsert");
        playlist_upsert(&conn, 2, "/music/new.mp3").expect("upsert");
        playlist_update_identity(&conn, 0, uid).expect("update");
        playlist_update_identity(&conn, 1, UID_UNKNOWN).expect("update");

        let positions = identified_positions(&conn).expect("query");
        assert_eq!(positions, vec![(0, NEW_SONG_RATING)]);
    }

    #[test]
    fn test_last_played_roundtrip() {
        let conn = open_in_memory().expect("db");

        let uid = ensure_song(&conn, "/music/a.mp3").expect("sighting");
        assert_eq!(last_played(&conn, uid).expect("fresh"), 0);

        touch_last_played(&conn, uid, 1_700_000_000).expect("touch");
        assert_eq!(last_played(&conn, uid).expect("stamped"), 1_700_000_000);
    }
}
