//! # batchscribe-core
//!
//! Resumable batch transcription of an audio directory through a list of
//! speech models.
//!
//! ## Architecture
//!
//! ```text
//! catalog::list_items ──► BatchOrchestrator ──► ResultStore (skip check, write)
//!                              │     ▲
//!                    ModelLoader::load / release   (one model live at a time)
//!                              │     │
//!                        TimeoutGuard (worker thread + deadline)
//!                              │
//!                     SpeechModel::transcribe  (stub | command | onnx)
//!                              │
//!                 RunReport ◄──┴──► broadcast::Sender<BatchEvent>
//! ```
//!
//! An artifact on disk is the only record that a (model, item) pair is done,
//! so interrupted runs resume by simply running again.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod batch;
pub mod catalog;
pub mod error;
pub mod guard;
pub mod inference;
pub mod ipc;
pub mod report;
pub mod store;

// Convenience re-exports for downstream crates
pub use batch::{BatchConfig, BatchOrchestrator, ModelSummary, RunSummary, TimeoutPolicy};
pub use catalog::{list_items, AudioItem};
pub use error::{Result, ScribeError};
pub use guard::{run_with_timeout, GuardOutcome, TimeoutGuard};
pub use inference::{
    BackendKind, BackendLoader, BackendOptions, Device, Interrupter, LanguageHint, ModelHandle,
    ModelLoader, ModelSpec, ReleaseMode, SpeechModel,
};
pub use ipc::events::{BatchEvent, TaskOutcome};
pub use report::RunReport;
pub use store::{ModelStatus, ResultStore};

#[cfg(feature = "onnx")]
pub use inference::{OnnxModel, OnnxModelConfig};
