//! Tag-reading seam.
//!
//! Low-level tag parsing is not this daemon's business; it only needs the
//! raw (artist, album, title) strings a file claims for itself, and it
//! treats them as unreliable input to the inference cascade anyway.
//! [`FileTags`] reads them with lofty; [`NoTags`] is for tests and for
//! players that stream their own metadata.

use lofty::prelude::*;
use log::debug;
use std::path::Path;

/// Raw tag fields as found in the file. Any of them may be empty.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub artist: String,
    pub album: String,
    pub title: String,
}

/// Source of raw tag fields for a path.
pub trait TagReader {
    fn read_tags(&self, path: &Path) -> TagInfo;
}

/// Reads tags from the audio file itself.
pub struct FileTags;

impl TagReader for FileTags {
    fn read_tags(&self, path: &Path) -> TagInfo {
        let tagged = match lofty::read_from_path(path) {
            Ok(tagged) => tagged,
            Err(e) => {
                debug!("no readable tags in {}: {e}", path.display());
                return TagInfo::default();
            }
        };

        let Some(tag) = tagged.primary_tag().or_else(|| tagged.first_tag()) else {
            return TagInfo::default();
        };

        TagInfo {
            artist: tag.artist().map(|s| s.into_owned()).unwrap_or_default(),
            album: tag.album().map(|s| s.into_owned()).unwrap_or_default(),
            title: tag.title().map(|s| s.into_owned()).unwrap_or_default(),
        }
    }
}

/// Yields no tags; the cascade then works from the path alone.
pub struct NoTags;

impl TagReader for NoTags {
    fn read_tags(&self, _path: &Path) -> TagInfo {
        TagInfo::default()
    }
}
