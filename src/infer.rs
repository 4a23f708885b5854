//! # Metadata Inference Cascade
//!
//! Turns an unreliable (path, tags) pair into a confirmed (artist, title)
//! pair, or refuses. Tags lie: compilations carry "Various Artists",
//! rips carry "Track 07", and half of everything carries nothing at all.
//! The filename and the directories above it usually know better, so each
//! heuristic here is a tie-break over the previous one, and the catalog of
//! already-confirmed artists and titles is consulted at every step.
//!
//! Artist confirmation is a hard prerequisite: if no step can confirm an
//! artist, the whole inference fails and the title is never attempted.
//!
//! All free-text comparison happens on normalized strings (lower-cased,
//! punctuation collapsed to single spaces) with a bounded edit-distance
//! similarity test where exact equality is too brittle.

use anyhow::Result;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use rusqlite::Connection;
use std::path::Path;

use crate::db;
use crate::tags::TagInfo;

/// Edit-distance bound for artist confirmation and segment matching.
pub const ARTIST_DISTANCE: usize = 4;

/// Looser edit-distance bound for the tag-title trust shortcut.
pub const TITLE_DISTANCE: usize = 6;

lazy_static! {
    /// Words that mark a string as a variant of something, not a title.
    static ref REMIX_CLUE: Regex =
        Regex::new("rmx|mix|[^a-z]version|edit|original|remaster|cut|instrumental|extended")
            .unwrap();
    /// Segments that cannot be a title: remix clues plus tag placeholders.
    static ref SUSPECT_TITLE: Regex = Regex::new(
        "rmx|mix|[^a-z]version|edit|original|remaster|cut|instrumental|extended|^track$|^title$"
    )
    .unwrap();
    /// Placeholder "artists" that identify nobody.
    static ref BAD_ARTIST: Regex =
        Regex::new(r"^(artists?|va|various( .*)?|collections?|misc( .*)?)$").unwrap();
    /// Leading track number on a filename, with its separator.
    static ref TRACK_NUMBER: Regex = Regex::new(r"^\d{1,4}([\s._-]+|$)").unwrap();
    /// Explicit field delimiter of a structured "Artist - Title" name.
    static ref STRUCT_DELIM: Regex = Regex::new(r"\s+-\s+|_-_").unwrap();
    /// Lax separators used when no structured delimiter is present.
    static ref LAX_DELIM: Regex = Regex::new(r"[-_.]+").unwrap();
    /// Trailing disc qualifier on an album string.
    static ref DISC_SUFFIX: Regex = Regex::new(r" (disc|disk|cd) ?\d+$").unwrap();
}

/// Lower-case and collapse every non-alphanumeric run to a single space.
pub fn string_normalize(s: &str) -> String {
    let lowered: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Bounded edit-distance similarity.
pub fn string_like(a: &str, b: &str, threshold: usize) -> bool {
    strsim::levenshtein(a, b) <= threshold
}

fn title_filter(s: &str) -> String {
    string_normalize(s)
}

fn album_filter(s: &str) -> String {
    let normalized = string_normalize(s);
    DISC_SUFFIX.replace(&normalized, "").into_owned()
}

/// `text` contains `album` followed somewhere later by a remix clue.
fn album_then_clue(text: &str, album: &str) -> bool {
    if album.is_empty() {
        return false;
    }
    match text.find(album) {
        Some(at) => REMIX_CLUE.is_match(&text[at + album.len()..]),
        None => false,
    }
}

/// File stem plus a simplified variant with any leading track number gone.
fn filename_mask(path: &str) -> (String, String) {
    let stem = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    (stem.clone(), strip_track_number(&stem))
}

fn strip_track_number(stem: &str) -> String {
    let mut rest = stem.trim().to_string();
    while let Some(m) = TRACK_NUMBER.find(&rest) {
        rest = rest[m.end()..].to_string();
    }
    rest
}

/// Segment the file stem into candidate fields.
///
/// Returns the normalized segments and whether the parse was "confident":
/// a structured `Artist - Title` style delimiter produced at least two
/// fields. Without one, segments come from a lax separator split and carry
/// much less meaning.
fn parse_filename(stem: &str) -> (Vec<String>, bool) {
    let rest = strip_track_number(stem);

    let fields: Vec<String> = STRUCT_DELIM
        .split(&rest)
        .map(string_normalize)
        .filter(|f| !f.is_empty())
        .collect();
    if fields.len() >= 2 {
        return (fields, true);
    }

    let parts: Vec<String> = LAX_DELIM
        .split(&rest)
        .map(string_normalize)
        .filter(|f| !f.is_empty())
        .collect();
    (parts, false)
}

/// Ancestor directory names, innermost first, normalized.
fn parse_path(path: &str) -> Vec<String> {
    let mut parts: Vec<String> = Path::new(path)
        .parent()
        .map(|dir| {
            dir.components()
                .filter_map(|c| match c {
                    std::path::Component::Normal(name) => {
                        let normalized = string_normalize(&name.to_string_lossy());
                        (!normalized.is_empty()).then_some(normalized)
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    parts.reverse();
    parts
}

/// Run the full cascade. `Ok(None)` means "could not identify"; tag fields
/// are then left as the unreliable originals.
pub fn parse_song_info(
    conn: &Connection,
    path: &str,
    tags: &TagInfo,
) -> Result<Option<(String, String)>> {
    let tag_artist = string_normalize(&tags.artist);
    let bad_tag_artist = tag_artist.is_empty() || BAD_ARTIST.is_match(&tag_artist);

    let (mask, simplified) = filename_mask(path);
    let (mut file_parts, parser_confident) = parse_filename(&mask);
    let mask = string_normalize(&mask);
    let simplified = string_normalize(&simplified);
    let path_parts = parse_path(path);

    let mut artist = tag_artist.clone();
    let mut artist_confirmed = false;

    // Any filename segment that is a known artist, or close enough to the
    // tag artist, wins.
    if file_parts.len() > 1 {
        for part in &file_parts {
            if db::check_artist(conn, part)?
                || (!bad_tag_artist && string_like(part, &tag_artist, ARTIST_DISTANCE))
            {
                artist = part.clone();
                artist_confirmed = true;
                break;
            }
        }
    }

    // Next, the directories above the file, innermost outward. While
    // scanning, remember the outermost directory that shows up inside the
    // filename mask as a fallback candidate.
    let mut overlap_dir = String::new();
    if !artist_confirmed {
        for dir in &path_parts {
            if BAD_ARTIST.is_match(dir) {
                continue;
            }
            if db::check_artist(conn, dir)?
                || (!bad_tag_artist && string_like(dir, &tag_artist, ARTIST_DISTANCE))
            {
                artist = dir.clone();
                artist_confirmed = true;
                break;
            }
            if mask.contains(dir.as_str()) {
                overlap_dir = dir.clone();
            }
        }
    }

    // A directory echoed at the very start of the filename is probably the
    // artist of an "Artist - Title" style name the parser did not catch.
    if !artist_confirmed && !overlap_dir.is_empty() {
        if let Some(at) = simplified.find(&overlap_dir) {
            if at < 2 {
                artist = overlap_dir.clone();
                artist_confirmed = true;
            }
        }
    }

    if !artist_confirmed && parser_confident && file_parts.len() > 1 {
        artist = file_parts[0].clone();
        artist_confirmed = true;
    }

    // Give a plausible tag artist the chance to override the guess.
    if !bad_tag_artist && !string_like(&tag_artist, &artist, ARTIST_DISTANCE) {
        if db::check_artist(conn, &tag_artist)? || mask.contains(tag_artist.as_str()) {
            artist = tag_artist.clone();
            artist_confirmed = true;
        }
    }

    if !artist_confirmed {
        debug!("no artist for {path}, giving up");
        return Ok(None);
    }

    // The confirmed artist segment must not double as the title.
    if let Some(at) = file_parts.iter().position(|p| *p == artist) {
        file_parts.remove(at);
    }

    // The album is only a support value. Prefer the tag album; fall back to
    // the innermost directory when the tag is empty or contained in it.
    let tag_album = album_filter(&tags.album);
    let directory = album_filter(path_parts.first().map(String::as_str).unwrap_or(""));
    let album = if tag_album.is_empty() || directory.contains(&tag_album) {
        directory
    } else {
        tag_album
    };

    let mut title = title_filter(&tags.title);

    // Already a known pair: we were only missing the artist.
    if !title.is_empty() && db::check_title(conn, &artist, &title)? {
        return Ok(Some((artist, title)));
    }

    // "<album> ... remix" in title position, or a filename ending exactly in
    // the album, means the album is standing in for the title.
    let mut flagged = false;
    if album_then_clue(&title, &album) {
        flagged = true;
        title = album.clone();
    } else if !album.is_empty() && mask.ends_with(&album) {
        flagged = true;
        title = album.clone();
    }

    // Match the remaining filename segments against the catalog and the
    // current candidate, rightmost first.
    for part in file_parts.iter().rev() {
        if db::check_title(conn, &artist, part)?
            || (!title.is_empty() && string_like(part, &title, ARTIST_DISTANCE))
            || title.starts_with(part.as_str())
        {
            return Ok(Some((artist, part.clone())));
        }
        if album_then_clue(part, &album) {
            return Ok(Some((artist, album)));
        }
        if !title.is_empty() && part.starts_with(&title) {
            return Ok(Some((artist, title)));
        }
    }

    if flagged {
        return Ok(Some((artist, title)));
    }

    // Trust a plausible tag title when the tag artist also looked sane and
    // normalization barely changed it.
    if !title.is_empty()
        && !SUSPECT_TITLE.is_match(&title)
        && !bad_tag_artist
        && string_like(&tags.title.to_lowercase(), &title, TITLE_DISTANCE)
    {
        return Ok(Some((artist, title)));
    }

    // Scrub segments that are clearly not titles; whatever survives on the
    // right is the title, provided the parser understood the name at all.
    file_parts.retain(|p| !SUSPECT_TITLE.is_match(p));

    if parser_confident {
        if let Some(last) = file_parts.last() {
            return Ok(Some((artist, last.clone())));
        }
    }

    // Nothing left. Maybe a remix album.
    if file_parts.is_empty() && db::check_title(conn, &artist, &album)? {
        return Ok(Some((artist, album)));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(artist: &str, album: &str, title: &str) -> TagInfo {
        TagInfo {
            artist: artist.to_string(),
            album: album.to_string(),
            title: title.to_string(),
        }
    }

    fn catalog_with(entries: &[(&str, &str)]) -> Connection {
        let conn = db::open_in_memory().expect("db");
        for (i, (artist, title)) in entries.iter().enumerate() {
            let uid = db::ensure_song(&conn, &format!("/seed/{i}.mp3")).expect("seed");
            db::set_song_info(&conn, uid, artist, title).expect("seed info");
        }
        conn
    }

    #[test]
    fn test_normalize_collapses_punctuation() {
        assert_eq!(string_normalize("Artist -- Name!!"), "artist name");
        assert_eq!(string_normalize("  A.B_C  "), "a b c");
        assert_eq!(string_normalize("ΣIGMA"), "σigma");
    }

    #[test]
    fn test_fuzzy_thresholds() {
        // Four edits pass the strict bound, five do not.
        assert!(string_like("abcdefgh", "abcd", ARTIST_DISTANCE));
        assert!(!string_like("abcdefghi", "abcd", ARTIST_DISTANCE));
        // Six edits pass the lenient bound, seven do not.
        assert!(string_like("abcdefghij", "abcd", TITLE_DISTANCE));
        assert!(!string_like("abcdefghijk", "abcd", TITLE_DISTANCE));
    }

    #[test]
    fn test_bad_artist_placeholders() {
        for bad in ["Various Artists", "various", "VA", "artist", "Misc stuff"] {
            assert!(
                BAD_ARTIST.is_match(&string_normalize(bad)),
                "{bad} should be flagged"
            );
        }
        // A real name containing the word "artist" is not a placeholder.
        assert!(!BAD_ARTIST.is_match("artist name"));
    }

    #[test]
    fn test_structured_filename_is_confident() {
        let (parts, confident) = parse_filename("Artist Name - Song Title");
        assert!(confident);
        assert_eq!(parts, vec!["artist name", "song title"]);

        let (parts, confident) = parse_filename("02 Track");
        assert!(!confident);
        assert_eq!(parts, vec!["track"]);
    }

    #[test]
    fn test_confident_parse_of_untagged_file() {
        // Scenario: "Artist Name - Song Title.mp3" in a generic directory,
        // no tags at all. The parser alone carries the day.
        let conn = db::open_in_memory().expect("db");

        let inferred = parse_song_info(
            &conn,
            "/music/stuff/Artist Name - Song Title.mp3",
            &tags("", "", ""),
        )
        .expect("cascade")
        .expect("identified");

        assert_eq!(inferred, ("artist name".to_string(), "song title".to_string()));
    }

    #[test]
    fn test_compilation_rip_resolved_from_directories() {
        // Scenario: a "Various Artists" rip named "02 Track.mp3" under
        // .../Artist Name/Album/. The artist comes from the directory scan,
        // the title from the remix-album fallback.
        let conn = catalog_with(&[("artist name", "album")]);

        let inferred = parse_song_info(
            &conn,
            "/music/Artist Name/Album/02 Track.mp3",
            &tags("Various Artists", "", ""),
        )
        .expect("cascade")
        .expect("identified");

        assert_eq!(inferred, ("artist name".to_string(), "album".to_string()));
    }

    #[test]
    fn test_known_pair_shortcut() {
        let conn = catalog_with(&[("some band", "blue song")]);

        let inferred = parse_song_info(
            &conn,
            "/music/Some Band/whatever/07 junk.mp3",
            &tags("Some Band", "", "Blue Song"),
        )
        .expect("cascade")
        .expect("identified");

        assert_eq!(inferred, ("some band".to_string(), "blue song".to_string()));
    }

    #[test]
    fn test_album_clue_redirects_title() {
        let conn = db::open_in_memory().expect("db");

        let inferred = parse_song_info(
            &conn,
            "/music/Some Band/Blue Album/03 whatever.mp3",
            &tags("Some Band", "Blue Album", "Blue Album Extended Mix"),
        )
        .expect("cascade")
        .expect("identified");

        assert_eq!(inferred, ("some band".to_string(), "blue album".to_string()));
    }

    #[test]
    fn test_plausible_tag_title_is_trusted() {
        let conn = db::open_in_memory().expect("db");

        let inferred = parse_song_info(
            &conn,
            "/music/Good Artist/Sessions/07 random junk noise.mp3",
            &tags("Good Artist", "", "Some Nice Song"),
        )
        .expect("cascade")
        .expect("identified");

        assert_eq!(
            inferred,
            ("good artist".to_string(), "some nice song".to_string())
        );
    }

    #[test]
    fn test_unidentifiable_file_fails() {
        let conn = db::open_in_memory().expect("db");

        let inferred = parse_song_info(&conn, "/music/x/random.mp3", &tags("", "", ""))
            .expect("cascade");

        assert_eq!(inferred, None);
    }

    #[test]
    fn test_artist_segment_cannot_double_as_title() {
        // Confident parse with the artist repeated: the first occurrence is
        // consumed by artist confirmation, the rightmost segment remains
        // for the title.
        let conn = db::open_in_memory().expect("db");

        let inferred = parse_song_info(
            &conn,
            "/music/stuff/Echo - Echo - Reflection.mp3",
            &tags("", "", ""),
        )
        .expect("cascade")
        .expect("identified");

        assert_eq!(inferred, ("echo".to_string(), "reflection".to_string()));
    }

    #[test]
    fn test_remix_clue_segments_are_scrubbed() {
        let conn = db::open_in_memory().expect("db");

        // "Original Mix" is a clue, never a title.
        let inferred = parse_song_info(
            &conn,
            "/music/stuff/Some Band - Daylight - Original Mix.mp3",
            &tags("", "", ""),
        )
        .expect("cascade")
        .expect("identified");

        assert_eq!(inferred, ("some band".to_string(), "daylight".to_string()));
    }
}
