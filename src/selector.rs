//! Next-track selection seam.
//!
//! The daemon's job is to keep the playlist mirror and song identities
//! straight; deciding what actually plays next belongs to a scorer behind
//! the [`Chooser`] trait. The [`RatingChooser`] shipped here is a plain
//! rating-weighted random pick so the daemon is useful on its own; a
//! correlation/acoustic scorer can replace it without touching the
//! synchronizer.

use log::debug;
use rand::Rng;
use rusqlite::Connection;

use crate::db;

/// External selection algorithm.
pub trait Chooser {
    /// Pick the next playlist position, or `None` when nothing qualifies.
    fn select_next(&mut self, conn: &Connection, current: Option<u32>) -> Option<u32>;

    /// Playback outcome for a song: finished naturally, jumped away from,
    /// or flagged bad by the player. Scoring input only.
    fn song_ended(&mut self, uid: i64, finished: bool, jumped: bool, bad: bool);
}

/// Rating-weighted random selection over identified playlist items.
#[derive(Debug, Default)]
pub struct RatingChooser;

impl Chooser for RatingChooser {
    fn select_next(&mut self, conn: &Connection, current: Option<u32>) -> Option<u32> {
        let candidates = match db::identified_positions(conn) {
            Ok(candidates) => candidates,
            Err(e) => {
                debug!("candidate query failed: {e}");
                return None;
            }
        };

        let eligible: Vec<(u32, i64)> = candidates
            .into_iter()
            .filter(|(pos, rating)| Some(*pos) != current && *rating > 0)
            .collect();

        let total: i64 = eligible.iter().map(|(_, rating)| rating).sum();
        if total <= 0 {
            return None;
        }

        let mut roll = rand::thread_rng().gen_range(0..total);
        for (pos, rating) in &eligible {
            roll -= rating;
            if roll < 0 {
                return Some(*pos);
            }
        }
        None
    }

    fn song_ended(&mut self, uid: i64, finished: bool, jumped: bool, bad: bool) {
        debug!("song {uid} ended: finished={finished} jumped={jumped} bad={bad}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_playlist(paths: &[&str]) -> Connection {
        let conn = db::open_in_memory().expect("db");
        for (pos, path) in paths.iter().enumerate() {
            let uid = db::ensure_song(&conn, path).expect("song");
            db::playlist_upsert(&conn, pos as u32, path).expect("slot");
            db::playlist_update_identity(&conn, pos as u32, uid).expect("identity");
        }
        conn
    }

    #[test]
    fn test_empty_playlist_yields_nothing() {
        let conn = db::open_in_memory().expect("db");
        assert_eq!(RatingChooser.select_next(&conn, None), None);
    }

    #[test]
    fn test_current_position_is_never_picked() {
        let conn = seeded_playlist(&["/m/a.mp3"]);

        assert_eq!(RatingChooser.select_next(&conn, Some(0)), None);
        assert_eq!(RatingChooser.select_next(&conn, None), Some(0));
    }

    #[test]
    fn test_unidentified_items_are_not_eligible() {
        let conn = seeded_playlist(&["/m/a.mp3"]);
        db::playlist_upsert(&conn, 7, "/m/unidentified.mp3").expect("slot");

        let mut chooser = RatingChooser;
        for _ in 0..20 {
            assert_eq!(chooser.select_next(&conn, None), Some(0));
        }
    }

    #[test]
    fn test_selection_stays_in_playlist() {
        let conn = seeded_playlist(&["/m/a.mp3", "/m/b.mp3", "/m/c.mp3"]);

        let mut chooser = RatingChooser;
        for _ in 0..50 {
            let pick = chooser.select_next(&conn, Some(1)).expect("pick");
            assert!(pick == 0 || pick == 2);
        }
    }
}
