//! Fetch missing Whisper export files from a HuggingFace-compatible hub.
//!
//! `optimum` exports live either at the repository root or under `onnx/`;
//! both are tried, `onnx/` first. Files are streamed into a temp file in
//! the model directory and renamed into place, so a cut-off download never
//! looks like a complete model.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::error::{Result, ScribeError};

pub const REQUIRED_FILES: [&str; 3] = ["encoder_model.onnx", "decoder_model.onnx", "tokenizer.json"];

/// Local directory name for a hub id: `openai/whisper-small` →
/// `openai--whisper-small`.
pub fn sanitize_model_id(id: &str) -> String {
    id.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("--")
}

pub fn missing_files(dir: &Path) -> Vec<&'static str> {
    REQUIRED_FILES
        .iter()
        .copied()
        .filter(|f| !dir.join(f).is_file())
        .collect()
}

pub struct HubClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HubClient {
    /// # Errors
    /// `ScribeError::Download` if the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .map_err(|e| ScribeError::Download {
                url: base_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn candidate_urls(&self, model_id: &str, file: &str) -> [String; 2] {
        let repo = model_id.trim_matches('/');
        [
            format!("{}/{repo}/resolve/main/onnx/{file}", self.base_url),
            format!("{}/{repo}/resolve/main/{file}", self.base_url),
        ]
    }

    /// Download every file in `files` into `dir`.
    ///
    /// # Errors
    /// `ScribeError::Download` naming the last URL tried when a file is
    /// found under neither location.
    pub fn fetch_missing(&self, model_id: &str, dir: &Path, files: &[&str]) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for file in files {
            let dest = dir.join(file);
            let mut last_err = None;
            for url in self.candidate_urls(model_id, file) {
                match self.download(&url, &dest) {
                    Ok(bytes) => {
                        info!(model = %model_id, file, bytes, "downloaded model file");
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "model file download attempt failed");
                        last_err = Some(e);
                    }
                }
            }
            if let Some(e) = last_err {
                return Err(e);
            }
        }
        Ok(())
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let download_err = |reason: String| ScribeError::Download {
            url: url.to_string(),
            reason,
        };
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| download_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(download_err(format!("HTTP {}", response.status())));
        }

        let dir = dest.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let mut tmp = NamedTempFile::new_in(&dir)?;
        let bytes = response
            .copy_to(&mut tmp)
            .map_err(|e| download_err(e.to_string()))?;
        tmp.flush()?;
        tmp.persist(dest).map_err(|e| ScribeError::Io(e.error))?;
        Ok(bytes)
    }
}
