//! Whisper ONNX backend via the `ort` crate.
//!
//! Targets the HuggingFace `optimum` separate encoder + decoder export:
//! - `encoder_model.onnx`: input `[1,n_mels,3000]` → `last_hidden_state [1,1500,d_model]`
//! - `decoder_model.onnx`: `input_ids [1,seq]` + `encoder_hidden_states`
//!   → `logits [1,seq,vocab]`
//! - `tokenizer.json`: HuggingFace fast tokenizer
//!
//! Each item is read as WAV, downmixed, resampled to 16 kHz and decoded in
//! 30 s windows. Window texts are joined with a single space.

pub mod decode;
pub mod hub;
pub mod mel;

use std::path::{Path, PathBuf};

use ort::ep;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::Value;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::{
    audio::{read_wav_mono, MODEL_SAMPLE_RATE},
    error::{Result, ScribeError},
    inference::{BackendOptions, Device, LanguageHint, ModelSpec, SpeechModel},
};

use self::decode::{greedy_decode, step_budget, EncoderStates, TokenSet};
use self::hub::{missing_files, sanitize_model_id, HubClient};
use self::mel::{MelFrontend, DEFAULT_N_MELS, N_FRAMES, WINDOW_SAMPLES};

fn onnx_err(e: impl std::fmt::Display) -> ScribeError {
    ScribeError::OnnxSession(e.to_string())
}

// ── Model config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OnnxModelConfig {
    /// Hub id, used for downloads and log fields.
    pub model_id: String,
    pub model_dir: PathBuf,
    pub device: Device,
    /// Hub base URL; `None` disables downloads.
    pub hub_url: Option<String>,
}

impl OnnxModelConfig {
    /// `<models_root>/<sanitized id>/`, unless the id is itself an existing
    /// directory holding an export.
    pub fn for_spec(spec: &ModelSpec, options: &BackendOptions) -> Self {
        let as_path = Path::new(&spec.id);
        let model_dir = if as_path.is_dir() {
            as_path.to_path_buf()
        } else {
            options.models_root.join(sanitize_model_id(&spec.id))
        };
        Self {
            model_id: spec.id.clone(),
            model_dir,
            device: spec.device,
            hub_url: options.allow_download.then(|| options.hub_url.clone()),
        }
    }

    pub fn encoder_path(&self) -> PathBuf {
        self.model_dir.join("encoder_model.onnx")
    }

    pub fn decoder_path(&self) -> PathBuf {
        self.model_dir.join("decoder_model.onnx")
    }

    pub fn tokenizer_path(&self) -> PathBuf {
        self.model_dir.join("tokenizer.json")
    }
}

fn create_session(model_path: &Path, device: Device) -> Result<Session> {
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let intra_threads = logical_cores.clamp(2, 12);

    let mut builder = SessionBuilder::new()
        .map_err(onnx_err)?
        .with_intra_threads(intra_threads)
        .map_err(onnx_err)?
        .with_inter_threads(1)
        .map_err(onnx_err)?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(onnx_err)?;

    #[cfg(target_os = "windows")]
    {
        builder = match device {
            Device::Accelerator => {
                info!("ONNX EP: directml -> cpu");
                builder
                    .with_execution_providers([
                        ep::DirectML::default()
                            .with_device_id(0)
                            .build()
                            .fail_silently(),
                        ep::CPU::default().build(),
                    ])
                    .map_err(onnx_err)?
            }
            Device::Cpu => builder
                .with_execution_providers([ep::CPU::default().build()])
                .map_err(onnx_err)?,
        };
    }

    #[cfg(not(target_os = "windows"))]
    {
        if device == Device::Accelerator {
            warn!("accelerator requested but no GPU execution provider on this platform; using CPU EP");
        }
        builder = builder
            .with_execution_providers([ep::CPU::default().build()])
            .map_err(onnx_err)?;
    }

    debug!(path = ?model_path, intra_threads, "creating ONNX session");
    builder.commit_from_file(model_path).map_err(onnx_err)
}

// ── OnnxModel ────────────────────────────────────────────────────────────────

struct Loaded {
    encoder: Session,
    decoder: Session,
    tokenizer: Tokenizer,
    specials: TokenSet,
    frontend: MelFrontend,
}

pub struct OnnxModel {
    config: OnnxModelConfig,
    loaded: Option<Loaded>,
}

impl OnnxModel {
    pub fn new(config: OnnxModelConfig) -> Self {
        Self {
            config,
            loaded: None,
        }
    }

    fn ensure_files(&self) -> Result<()> {
        let missing = missing_files(&self.config.model_dir);
        if missing.is_empty() {
            return Ok(());
        }
        let Some(hub_url) = &self.config.hub_url else {
            return Err(ScribeError::ModelNotFound {
                path: self.config.model_dir.join(missing[0]),
            });
        };
        info!(
            model = %self.config.model_id,
            dir = ?self.config.model_dir,
            ?missing,
            "fetching model files"
        );
        HubClient::new(hub_url)?.fetch_missing(&self.config.model_id, &self.config.model_dir, &missing)
    }

    fn transcribe_window(loaded: &mut Loaded, window: &[f32], prefix: &[i64]) -> Result<String> {
        let features = loaded.frontend.features(window);
        let input = Value::from_array(features).map_err(onnx_err)?;
        let enc_out = loaded
            .encoder
            .run(ort::inputs!["input_features" => input])
            .map_err(onnx_err)?;
        let (shape, data) = enc_out["last_hidden_state"]
            .try_extract_tensor::<f32>()
            .map_err(onnx_err)?;
        if shape.len() < 3 {
            return Err(ScribeError::OnnxSession(format!(
                "unexpected encoder output rank {}",
                shape.len()
            )));
        }
        let states = EncoderStates {
            data,
            frames: shape[1] as usize,
            d_model: shape[2] as usize,
        };

        let seconds = window.len() as f32 / MODEL_SAMPLE_RATE as f32;
        let generated = greedy_decode(
            &mut loaded.decoder,
            &loaded.specials,
            &states,
            prefix,
            step_budget(seconds),
        )?;
        let text_tokens: Vec<u32> = generated.iter().map(|&t| t as u32).collect();
        let text = loaded
            .tokenizer
            .decode(&text_tokens, true)
            .map_err(onnx_err)?;
        Ok(text.trim().to_string())
    }
}

impl SpeechModel for OnnxModel {
    fn warm_up(&mut self) -> Result<()> {
        self.ensure_files()?;

        let encoder_path = self.config.encoder_path();
        info!(model = %self.config.model_id, path = ?encoder_path, device = %self.config.device, "loading encoder");
        let encoder = create_session(&encoder_path, self.config.device)?;

        // Some exports (large-v3) use 128 mel bins.
        let n_mels = encoder
            .inputs()
            .first()
            .and_then(|i| i.dtype().tensor_shape())
            .filter(|s| s.len() >= 2 && s[1] > 0)
            .map(|s| s[1] as usize)
            .unwrap_or(DEFAULT_N_MELS);

        let decoder_path = self.config.decoder_path();
        info!(model = %self.config.model_id, path = ?decoder_path, "loading decoder");
        let decoder = create_session(&decoder_path, self.config.device)?;

        let tokenizer = Tokenizer::from_file(self.config.tokenizer_path()).map_err(onnx_err)?;
        let specials = TokenSet::from_tokenizer(&tokenizer);
        info!(
            n_mels,
            vocab = tokenizer.get_vocab_size(true),
            "ONNX model ready"
        );

        let mut loaded = Loaded {
            encoder,
            decoder,
            tokenizer,
            specials,
            frontend: MelFrontend::new(n_mels),
        };

        // Dummy encoder pass so the first real item does not pay for graph setup.
        let dummy = ndarray::Array3::<f32>::zeros((1, n_mels, N_FRAMES));
        let dummy = Value::from_array(dummy).map_err(onnx_err)?;
        loaded
            .encoder
            .run(ort::inputs!["input_features" => dummy])
            .map_err(onnx_err)?;

        self.loaded = Some(loaded);
        Ok(())
    }

    fn transcribe(&mut self, audio: &Path, language: &LanguageHint) -> Result<String> {
        let Some(loaded) = self.loaded.as_mut() else {
            return Err(ScribeError::OnnxSession("model not loaded".into()));
        };

        let clip = read_wav_mono(audio)?.resampled(MODEL_SAMPLE_RATE)?;
        if clip.is_empty() {
            return Ok(String::new());
        }
        let prefix = loaded.specials.prefix(&loaded.tokenizer, language);

        let mut parts = Vec::new();
        for window in clip.windows(WINDOW_SAMPLES) {
            let text = Self::transcribe_window(loaded, window, &prefix)?;
            if !text.is_empty() {
                parts.push(text);
            }
        }
        debug!(
            audio = ?audio,
            seconds = clip.duration_secs(),
            windows = parts.len(),
            "onnx transcription complete"
        );
        Ok(parts.join(" "))
    }

    fn release(&mut self) {
        if self.loaded.take().is_some() {
            info!(model = %self.config.model_id, "ONNX sessions dropped");
        }
    }
}
