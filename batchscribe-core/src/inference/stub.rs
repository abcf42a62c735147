//! `StubModel`: placeholder backend that echoes file metadata without real inference.
//!
//! Lets a full batch (catalog, store, guard, report) be exercised end-to-end
//! without model weights, e.g. `batchscribe run --model stub:dry-run`.

use std::path::Path;

use tracing::debug;

use crate::error::{Result, ScribeError};
use crate::inference::{LanguageHint, SpeechModel};

/// Echo-style stub model.
///
/// Every call returns `"[stub #<N>: <file name>, <bytes> bytes, lang=<hint>]"`.
pub struct StubModel {
    call_count: u64,
    loaded: bool,
}

impl StubModel {
    pub fn new() -> Self {
        Self {
            call_count: 0,
            loaded: false,
        }
    }
}

impl Default for StubModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechModel for StubModel {
    fn warm_up(&mut self) -> Result<()> {
        debug!("StubModel::warm_up (no-op)");
        self.loaded = true;
        Ok(())
    }

    fn transcribe(&mut self, audio: &Path, language: &LanguageHint) -> Result<String> {
        if !self.loaded {
            return Err(ScribeError::Inference("stub model not warmed up".into()));
        }
        let bytes = std::fs::metadata(audio)?.len();
        self.call_count += 1;

        let name = audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!(
            "[stub #{}: {name}, {bytes} bytes, lang={language}]",
            self.call_count
        ))
    }

    fn release(&mut self) {
        debug!(calls = self.call_count, "StubModel::release");
        self.loaded = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_file_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let audio = tmp.path().join("a.wav");
        std::fs::write(&audio, [0u8; 44]).unwrap();

        let mut model = StubModel::new();
        model.warm_up().unwrap();
        let text = model
            .transcribe(&audio, &LanguageHint::Code("nl".into()))
            .unwrap();
        assert_eq!(text, "[stub #1: a.wav, 44 bytes, lang=nl]");
    }

    #[test]
    fn missing_file_is_an_error() {
        let mut model = StubModel::new();
        model.warm_up().unwrap();
        assert!(model
            .transcribe(Path::new("/definitely/not/here.wav"), &LanguageHint::Auto)
            .is_err());
    }

    #[test]
    fn refuses_after_release() {
        let mut model = StubModel::new();
        model.warm_up().unwrap();
        model.release();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        assert!(model.transcribe(tmp.path(), &LanguageHint::Auto).is_err());
    }
}
