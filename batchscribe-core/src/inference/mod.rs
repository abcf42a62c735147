//! Speech model abstraction.
//!
//! The `SpeechModel` trait decouples the orchestrator from any specific
//! backend (stub echo, external recognizer process, ONNX Whisper). Each
//! backend hides its own invocation shape behind "one audio file in, text
//! out"; the orchestrator never branches on backend kind.
//!
//! `&mut self` on `transcribe` expresses that decoders are stateful. All
//! mutation is serialised through `ModelHandle`'s `parking_lot::Mutex`, which
//! also lets the orchestrator observe whether an abandoned call still occupies
//! the engine.

pub mod command;
pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxModel, OnnxModelConfig};

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, ScribeError};

use self::command::{CommandModel, CommandTemplate, ToolPaths};
use self::stub::StubModel;

/// Contract for speech recognition backends.
pub trait SpeechModel: Send + 'static {
    /// One-time preparation: fetch and load weights, open sessions.
    ///
    /// # Errors
    /// Returns an error if the model cannot be initialised. The orchestrator
    /// skips the whole model in that case.
    fn warm_up(&mut self) -> Result<()>;

    /// Transcribe one audio file.
    ///
    /// No internal deadline: bounding the call is the caller's job.
    fn transcribe(&mut self, audio: &Path, language: &LanguageHint) -> Result<String>;

    /// Free sessions, caches and device memory. Called exactly once per
    /// loaded model.
    fn release(&mut self);

    /// Aborts an in-flight `transcribe` from another thread, without taking
    /// the engine lock. `None` when calls cannot be interrupted.
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }
}

/// Cancels whatever call the backend is running. Must be a no-op when idle.
pub type Interrupter = Arc<dyn Fn() + Send + Sync>;

// ── Model description ────────────────────────────────────────────────────────

/// Which backend family serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process Whisper: mel frontend, encoder, greedy decode, tokenizer.
    Onnx,
    /// External recognizer executable, one process per item.
    Command,
    /// Deterministic placeholder text, no inference.
    Stub,
}

impl FromStr for BackendKind {
    type Err = ScribeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" | "whisper" => Ok(BackendKind::Onnx),
            "command" | "cmd" | "exec" => Ok(BackendKind::Command),
            "stub" => Ok(BackendKind::Stub),
            other => Err(ScribeError::Config(format!("unknown backend kind: {other}"))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Onnx => "onnx",
            BackendKind::Command => "command",
            BackendKind::Stub => "stub",
        };
        f.write_str(name)
    }
}

/// Compute target. Applied uniformly to every model of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Accelerator,
}

impl FromStr for Device {
    type Err = ScribeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "accelerator" | "mps" | "cuda" | "dml" | "directml" => Ok(Device::Accelerator),
            other => Err(ScribeError::Config(format!("unknown device: {other}"))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator => f.write_str("accelerator"),
        }
    }
}

/// Target language passed to every inference call of a run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LanguageHint {
    #[default]
    Auto,
    /// ISO-639-1 code, lowercase.
    Code(String),
}

impl LanguageHint {
    pub fn code(&self) -> Option<&str> {
        match self {
            LanguageHint::Auto => None,
            LanguageHint::Code(c) => Some(c),
        }
    }
}

impl FromStr for LanguageHint {
    type Err = ScribeError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim().to_ascii_lowercase();
        let code = match raw.as_str() {
            "" | "auto" => return Ok(LanguageHint::Auto),
            "english" | "eng" => "en",
            "dutch" | "nederlands" | "nld" => "nl",
            "german" | "deutsch" | "deu" => "de",
            "french" | "fra" => "fr",
            "mandarin" | "chinese" | "zh-cn" | "zh-hans" => "zh",
            "russian" | "rus" => "ru",
            other => other,
        };
        if (2..=3).contains(&code.len()) && code.chars().all(|c| c.is_ascii_lowercase()) {
            Ok(LanguageHint::Code(code.to_string()))
        } else {
            Err(ScribeError::Config(format!("invalid language hint: {s}")))
        }
    }
}

impl fmt::Display for LanguageHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code().unwrap_or("auto"))
    }
}

/// One model to run, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub id: String,
    pub backend: BackendKind,
    #[serde(default)]
    pub device: Device,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, backend: BackendKind, device: Device) -> Self {
        Self {
            id: id.into(),
            backend,
            device,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}

/// Parses `"<backend>:<id>"` or a bare `"<id>"` (ONNX backend, CPU).
///
/// The prefix is only treated as a backend when it names one, so ids that
/// contain `:` (e.g. Windows paths) survive.
impl FromStr for ModelSpec {
    type Err = ScribeError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ScribeError::Config("empty model id".into()));
        }
        if let Some((prefix, rest)) = s.split_once(':') {
            if let Ok(backend) = prefix.parse::<BackendKind>() {
                if rest.trim().is_empty() {
                    return Err(ScribeError::Config(format!("missing model id in {s:?}")));
                }
                return Ok(ModelSpec::new(rest.trim(), backend, Device::Cpu));
            }
        }
        Ok(ModelSpec::new(s, BackendKind::Onnx, Device::Cpu))
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.backend, self.id, self.device)
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Thread-safe reference-counted handle to a loaded `SpeechModel`.
///
/// Clones are given to inference workers. Only the orchestrator calls
/// `release`, and the backend's `release()` runs at most once however many
/// clones exist.
#[derive(Clone)]
pub struct ModelHandle {
    model_id: Arc<str>,
    inner: Arc<Mutex<dyn SpeechModel>>,
    released: Arc<AtomicBool>,
    interrupter: Option<Interrupter>,
}

/// How a `ModelHandle::release` was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// The backend was idle and released on the calling thread.
    Immediate,
    /// An abandoned call still held the engine; a reaper thread releases it
    /// once that call returns.
    Deferred,
    /// Already released through another clone.
    AlreadyReleased,
}

impl ModelHandle {
    /// Wrap any `SpeechModel` in a `ModelHandle`.
    pub fn new<M: SpeechModel>(model_id: &str, model: M) -> Self {
        let interrupter = model.interrupter();
        Self {
            model_id: Arc::from(model_id),
            inner: Arc::new(Mutex::new(model)),
            released: Arc::new(AtomicBool::new(false)),
            interrupter,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Blocking transcription on the calling thread.
    pub fn transcribe(&self, audio: &Path, language: &LanguageHint) -> Result<String> {
        if self.released.load(Ordering::SeqCst) {
            return Err(ScribeError::Inference(format!(
                "model {} already released",
                self.model_id
            )));
        }
        self.inner.lock().transcribe(audio, language)
    }

    /// `true` while some call holds the engine.
    pub fn is_busy(&self) -> bool {
        self.inner.is_locked()
    }

    /// Abort the in-flight call, if the backend supports it. Returns whether
    /// an interrupt was sent.
    pub fn interrupt(&self) -> bool {
        match &self.interrupter {
            Some(interrupt) if self.is_busy() => {
                interrupt();
                warn!(model = %self.model_id, "in-flight call interrupted");
                true
            }
            _ => false,
        }
    }

    /// Wait up to `grace` for any in-flight call to finish.
    pub fn wait_idle(&self, grace: Duration) -> bool {
        self.inner.try_lock_for(grace).is_some()
    }

    /// Release backend resources exactly once.
    pub fn release(self) -> ReleaseMode {
        if self.released.swap(true, Ordering::SeqCst) {
            return ReleaseMode::AlreadyReleased;
        }
        if let Some(mut model) = self.inner.try_lock() {
            model.release();
            info!(model = %self.model_id, "model released");
            return ReleaseMode::Immediate;
        }

        warn!(
            model = %self.model_id,
            "model still busy with an abandoned call; deferring release"
        );
        let inner = Arc::clone(&self.inner);
        let model_id = Arc::clone(&self.model_id);
        let spawned = std::thread::Builder::new()
            .name(format!("release-{model_id}"))
            .spawn(move || {
                inner.lock().release();
                info!(model = %model_id, "deferred model release complete");
            });
        if let Err(e) = spawned {
            // Without a reaper the last clone's Drop still frees the backend.
            warn!(model = %self.model_id, error = %e, "could not spawn release thread");
        }
        ReleaseMode::Deferred
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_id", &self.model_id)
            .field("released", &self.released.load(Ordering::Relaxed))
            .field("interruptible", &self.interrupter.is_some())
            .finish_non_exhaustive()
    }
}

// ── Loading ──────────────────────────────────────────────────────────────────

/// Turns a `ModelSpec` into a ready `ModelHandle`.
///
/// The orchestrator only sees this trait, so tests inject counting doubles
/// and new backends never touch the batch loop.
pub trait ModelLoader {
    fn load(&self, spec: &ModelSpec) -> Result<ModelHandle>;

    fn release(&self, handle: ModelHandle) -> ReleaseMode {
        handle.release()
    }
}

/// Options shared by the built-in backends.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Local cache of ONNX model directories.
    pub models_root: PathBuf,
    /// Allow fetching missing ONNX model files from the hub.
    pub allow_download: bool,
    /// HuggingFace-compatible hub base URL.
    pub hub_url: String,
    /// External tools, resolved once at startup.
    pub tools: ToolPaths,
    /// Argument template for the command backend.
    pub command_template: CommandTemplate,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            models_root: PathBuf::from("models"),
            allow_download: true,
            hub_url: "https://huggingface.co".into(),
            tools: ToolPaths::default(),
            command_template: CommandTemplate::default(),
        }
    }
}

/// `ModelLoader` that picks a built-in backend by `BackendKind`.
#[derive(Debug, Clone, Default)]
pub struct BackendLoader {
    options: BackendOptions,
}

impl BackendLoader {
    pub fn new(options: BackendOptions) -> Self {
        Self { options }
    }

    fn build(&self, spec: &ModelSpec) -> Result<ModelHandle> {
        match spec.backend {
            BackendKind::Stub => {
                let mut model = StubModel::new();
                model.warm_up()?;
                Ok(ModelHandle::new(&spec.id, model))
            }
            BackendKind::Command => {
                let program = self.options.tools.recognizer()?.to_path_buf();
                let mut model = CommandModel::new(
                    program,
                    spec.id.clone(),
                    spec.device,
                    self.options.command_template.clone(),
                );
                model.warm_up()?;
                Ok(ModelHandle::new(&spec.id, model))
            }
            #[cfg(feature = "onnx")]
            BackendKind::Onnx => {
                let config = OnnxModelConfig::for_spec(spec, &self.options);
                let mut model = OnnxModel::new(config);
                model.warm_up()?;
                Ok(ModelHandle::new(&spec.id, model))
            }
            #[cfg(not(feature = "onnx"))]
            BackendKind::Onnx => Err(ScribeError::ModelLoad {
                model: spec.id.clone(),
                reason: "built without the `onnx` feature".into(),
            }),
        }
    }
}

impl ModelLoader for BackendLoader {
    fn load(&self, spec: &ModelSpec) -> Result<ModelHandle> {
        info!(model = %spec.id, backend = %spec.backend, device = %spec.device, "loading model");
        self.build(spec).map_err(|e| match e {
            e @ ScribeError::ModelLoad { .. } => e,
            other => ScribeError::ModelLoad {
                model: spec.id.clone(),
                reason: other.to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_spec_parses_backend_prefix() {
        let spec: ModelSpec = "stub:m1".parse().unwrap();
        assert_eq!(spec.backend, BackendKind::Stub);
        assert_eq!(spec.id, "m1");

        let spec: ModelSpec = "openai/whisper-small".parse().unwrap();
        assert_eq!(spec.backend, BackendKind::Onnx);
        assert_eq!(spec.id, "openai/whisper-small");

        let spec: ModelSpec = r"command:C:\models\ggml-small.bin".parse().unwrap();
        assert_eq!(spec.backend, BackendKind::Command);
        assert_eq!(spec.id, r"C:\models\ggml-small.bin");

        assert!("stub:".parse::<ModelSpec>().is_err());
        assert!("  ".parse::<ModelSpec>().is_err());
    }

    #[test]
    fn language_hint_normalizes_names() {
        assert_eq!("Dutch".parse::<LanguageHint>().unwrap().code(), Some("nl"));
        assert_eq!("nl".parse::<LanguageHint>().unwrap().code(), Some("nl"));
        assert_eq!("auto".parse::<LanguageHint>().unwrap(), LanguageHint::Auto);
        assert!("klingon-9".parse::<LanguageHint>().is_err());
    }

    #[test]
    fn device_parses_accelerator_aliases() {
        assert_eq!("mps".parse::<Device>().unwrap(), Device::Accelerator);
        assert_eq!("CPU".parse::<Device>().unwrap(), Device::Cpu);
        assert!("tpu9".parse::<Device>().is_err());
    }

    struct CountingRelease(Arc<std::sync::atomic::AtomicUsize>);

    impl SpeechModel for CountingRelease {
        fn warm_up(&mut self) -> Result<()> {
            Ok(())
        }

        fn transcribe(&mut self, _audio: &Path, _language: &LanguageHint) -> Result<String> {
            Ok(String::new())
        }

        fn release(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_runs_once_across_clones() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handle = ModelHandle::new("m1", CountingRelease(Arc::clone(&count)));
        let clone = handle.clone();

        assert_eq!(handle.release(), ReleaseMode::Immediate);
        assert_eq!(clone.clone().release(), ReleaseMode::AlreadyReleased);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(clone
            .transcribe(Path::new("a.wav"), &LanguageHint::Auto)
            .is_err());
    }

    #[test]
    fn stub_backend_loads_without_files() {
        let loader = BackendLoader::default();
        let handle = loader
            .load(&ModelSpec::new("m1", BackendKind::Stub, Device::Cpu))
            .unwrap();
        assert_eq!(handle.model_id(), "m1");
        assert!(!handle.interrupt(), "stub calls cannot be interrupted");
        assert_eq!(loader.release(handle), ReleaseMode::Immediate);
    }
}
