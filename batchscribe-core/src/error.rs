use std::path::PathBuf;

use thiserror::Error;

/// All errors produced by batchscribe-core.
#[derive(Debug, Error)]
pub enum ScribeError {
    #[error("input directory not found: {path}")]
    InputDirMissing { path: PathBuf },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to load model {model}: {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("inference error: {0}")]
    Inference(String),

    #[error("unsupported audio format for this backend: {path}")]
    UnsupportedAudio { path: PathBuf },

    #[error("failed to persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("external tool not found: {0}")]
    ToolNotFound(String),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: PathBuf },

    #[error("download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("inference worker panicked")]
    WorkerPanicked,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScribeError {
    /// Setup and persistence errors halt the run; everything else is scoped
    /// to one model or one item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScribeError::InputDirMissing { .. }
                | ScribeError::Config(_)
                | ScribeError::Persistence { .. }
                | ScribeError::ToolNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ScribeError>;
