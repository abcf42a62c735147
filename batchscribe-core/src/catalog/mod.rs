//! Audio item discovery.
//!
//! Lists the recognised audio files of one source directory. Nothing is
//! opened or decoded here; an `AudioItem` is just a name and a path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, ScribeError};

/// Extensions accepted as audio input (compared case-insensitively).
pub const AUDIO_EXTENSIONS: [&str; 5] = ["wav", "mp3", "flac", "ogg", "m4a"];

/// One audio input discovered in the source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioItem {
    /// File name without extension. Keys the artifact in the result store.
    pub id: String,
    pub path: PathBuf,
    /// Extension as found on disk (original case preserved).
    pub extension: String,
}

impl AudioItem {
    /// Build an item from a path, or `None` if it is not a recognised audio file.
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?;
        if !is_audio_extension(extension) {
            return None;
        }
        let id = path.file_stem()?.to_str()?.to_string();
        if id.is_empty() {
            return None;
        }
        Some(Self {
            id,
            path: path.to_path_buf(),
            extension: extension.to_string(),
        })
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.id, self.extension)
    }
}

pub fn is_audio_extension(ext: &str) -> bool {
    AUDIO_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext))
}

/// List the audio items directly inside `dir`, sorted by file name.
///
/// Items whose identifier collides with an earlier one (`a.wav` + `a.mp3`)
/// would share one artifact; only the first is kept.
///
/// # Errors
/// `ScribeError::InputDirMissing` when `dir` does not exist or is not a directory.
pub fn list_items(dir: &Path) -> Result<Vec<AudioItem>> {
    if !dir.is_dir() {
        return Err(ScribeError::InputDirMissing {
            path: dir.to_path_buf(),
        });
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut seen = HashSet::new();
    let mut items = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(item) = AudioItem::from_path(&path) else {
            debug!(path = ?path, "ignoring non-audio file");
            continue;
        };
        if !seen.insert(item.id.clone()) {
            warn!(
                item = %item.id,
                path = ?item.path,
                "duplicate item identifier; keeping the first file only"
            );
            continue;
        }
        items.push(item);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn filters_by_extension_case_insensitively() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), "a.wav");
        touch(tmp.path(), "b.MP3");
        touch(tmp.path(), "c.Flac");
        touch(tmp.path(), "notes.txt");
        touch(tmp.path(), "noext");
        std::fs::create_dir(tmp.path().join("d.wav")).unwrap();

        let items = list_items(tmp.path()).unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(items[1].extension, "MP3");
        assert_eq!(items[1].file_name(), "b.MP3");
    }

    #[test]
    fn missing_directory_is_setup_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let err = list_items(&tmp.path().join("absent")).unwrap_err();
        assert!(matches!(err, ScribeError::InputDirMissing { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn duplicate_stems_keep_first_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), "a.wav");
        touch(tmp.path(), "a.mp3");

        let items = list_items(tmp.path()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].extension, "mp3");
    }

    #[test]
    fn empty_directory_yields_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(list_items(tmp.path()).unwrap().is_empty());
    }
}
