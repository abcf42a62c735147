//! On-disk transcript artifacts, one subdirectory per model.
//!
//! ```text
//! <root>/
//!   whisper-small/
//!     a.txt        ← transcript text
//!     b.txt        ← timeout sentinel
//!   timeout_files.json
//! ```
//!
//! Artifact existence is the only "already done" signal, so writes go through
//! a temp file in the same directory and are renamed into place. A crash
//! mid-write leaves a stray temp file, never a truncated artifact.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::catalog::AudioItem;
use crate::error::{Result, ScribeError};

pub const ARTIFACT_EXTENSION: &str = "txt";

#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

/// Per-model progress counters over a catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    pub model_id: String,
    pub total: usize,
    pub done: usize,
    pub timeouts: usize,
    pub pending: usize,
    /// Whitespace-separated words across real transcripts (sentinels excluded).
    pub words: usize,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one model's artifacts.
    ///
    /// Hub-style ids keep only their last segment: `openai/whisper-small`
    /// → `whisper-small`.
    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.root.join(model_dir_name(model_id))
    }

    pub fn artifact_path(&self, model_id: &str, item_id: &str) -> PathBuf {
        self.model_dir(model_id)
            .join(format!("{item_id}.{ARTIFACT_EXTENSION}"))
    }

    /// `true` if the pair already has an artifact (transcript or sentinel).
    pub fn exists(&self, model_id: &str, item_id: &str) -> bool {
        self.artifact_path(model_id, item_id).is_file()
    }

    /// Persist `text` as the artifact for the pair, creating the model
    /// directory if needed.
    ///
    /// # Errors
    /// `ScribeError::Persistence` on any filesystem failure.
    pub fn write(&self, model_id: &str, item_id: &str, text: &str) -> Result<PathBuf> {
        let dir = self.model_dir(model_id);
        std::fs::create_dir_all(&dir).map_err(|source| ScribeError::Persistence {
            path: dir.clone(),
            source,
        })?;

        let path = self.artifact_path(model_id, item_id);
        let persist_err = |source: std::io::Error| ScribeError::Persistence {
            path: path.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(&dir).map_err(persist_err)?;
        tmp.write_all(text.as_bytes()).map_err(persist_err)?;
        tmp.as_file().sync_all().map_err(persist_err)?;
        tmp.persist(&path).map_err(|e| persist_err(e.error))?;

        debug!(model = model_id, item = item_id, path = ?path, "artifact written");
        Ok(path)
    }

    /// Read an artifact back, `None` if it does not exist.
    pub fn read(&self, model_id: &str, item_id: &str) -> Result<Option<String>> {
        let path = self.artifact_path(model_id, item_id);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Count finished, timed-out and pending pairs for one model.
    pub fn status(
        &self,
        model_id: &str,
        items: &[AudioItem],
        timeout_marker: &str,
    ) -> Result<ModelStatus> {
        let mut status = ModelStatus {
            model_id: model_id.to_string(),
            total: items.len(),
            ..ModelStatus::default()
        };
        for item in items {
            match self.read(model_id, &item.id)? {
                None => status.pending += 1,
                Some(text) if text == timeout_marker => {
                    status.done += 1;
                    status.timeouts += 1;
                }
                Some(text) => {
                    status.done += 1;
                    status.words += text.split_whitespace().count();
                }
            }
        }
        Ok(status)
    }
}

pub fn model_dir_name(model_id: &str) -> String {
    let trimmed = model_id.trim_matches('/');
    match trimmed.rsplit('/').next() {
        Some(last) if !last.is_empty() => last.to_string(),
        _ => trimmed.replace('/', "_"),
    }
}
