//! Persistent batch settings (JSON file in the user data directory).
//!
//! Every field has a default, so a missing or partial file still loads.
//! CLI flags override the loaded values for a single invocation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Overrides the settings file location.
pub const SETTINGS_ENV: &str = "BATCHSCRIBE_SETTINGS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub input_dir: PathBuf,
    pub output_root: PathBuf,
    pub report_path: Option<PathBuf>,
    /// `"<backend>:<id>"` or bare hub ids, in processing order.
    pub models: Vec<String>,
    pub device: String,
    pub language: String,
    pub timeout_secs: u64,
    pub timeout_policy: String,
    pub timeout_marker: String,
    pub busy_grace_secs: u64,
    pub models_root: PathBuf,
    pub allow_download: bool,
    pub hub_url: String,
    /// Explicit path to the external recognizer; `None` searches `PATH`.
    pub recognizer_path: Option<PathBuf>,
    pub recognizer_name: String,
    /// Searched after `PATH` (e.g. `/opt/homebrew/bin`).
    pub tool_search_dirs: Vec<PathBuf>,
    /// Replaces the recognizer's default argument template when non-empty.
    pub command_args: Vec<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("output").join("segments"),
            output_root: PathBuf::from("output").join("transcripts"),
            report_path: None,
            models: Vec::new(),
            device: "cpu".into(),
            language: "nl".into(),
            timeout_secs: 60,
            timeout_policy: "markDone".into(),
            timeout_marker: "None".into(),
            busy_grace_secs: 30,
            models_root: default_data_dir().join("models"),
            allow_download: true,
            hub_url: "https://huggingface.co".into(),
            recognizer_path: None,
            recognizer_name: "whisper-cli".into(),
            tool_search_dirs: default_tool_search_dirs(),
            command_args: Vec::new(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.models = normalize_models(&self.models);
        self.device = normalize_device(&self.device);
        self.language = self.language.trim().to_ascii_lowercase();
        if self.language.is_empty() {
            self.language = "nl".into();
        }
        self.timeout_secs = self.timeout_secs.clamp(1, 3600);
        self.busy_grace_secs = self.busy_grace_secs.clamp(1, 3600);
        self.timeout_policy = normalize_timeout_policy(&self.timeout_policy);
        if self.timeout_marker.is_empty() {
            self.timeout_marker = "None".into();
        }
        self.hub_url = self.hub_url.trim().trim_end_matches('/').to_string();
        if self.hub_url.is_empty() {
            self.hub_url = "https://huggingface.co".into();
        }
        let name = self.recognizer_name.trim();
        self.recognizer_name = if name.is_empty() {
            "whisper-cli".into()
        } else {
            name.into()
        };
        self.recognizer_path = self
            .recognizer_path
            .take()
            .filter(|p| !p.as_os_str().is_empty());
    }
}

/// Trim, drop blanks and duplicates, keep order.
fn normalize_models(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for model in raw {
        let model = model.trim();
        if model.is_empty() || out.iter().any(|m| m == model) {
            continue;
        }
        out.push(model.to_string());
    }
    out
}

/// Canonical spelling for known devices. Anything else is kept (lowercased)
/// so that parsing rejects it instead of silently running on the CPU.
pub fn normalize_device(raw: &str) -> String {
    let raw = raw.trim().to_ascii_lowercase();
    match raw.as_str() {
        "" | "cpu" => "cpu".into(),
        "gpu" | "accelerator" | "mps" | "cuda" | "dml" | "directml" => "accelerator".into(),
        _ => raw,
    }
}

/// Like `normalize_device`: unknown policies survive for the parser to reject.
pub fn normalize_timeout_policy(raw: &str) -> String {
    let raw = raw.trim();
    match raw.to_ascii_lowercase().as_str() {
        "" | "markdone" | "mark-done" => "markDone".into(),
        "retry" => "retry".into(),
        _ => raw.to_string(),
    }
}

fn default_tool_search_dirs() -> Vec<PathBuf> {
    if cfg!(target_os = "macos") {
        vec![PathBuf::from("/opt/homebrew/bin"), PathBuf::from("/usr/local/bin")]
    } else {
        Vec::new()
    }
}

pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("batchscribe")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("batchscribe")
    }
}

pub fn default_settings_path() -> PathBuf {
    match std::env::var_os(SETTINGS_ENV) {
        Some(p) if !p.is_empty() => PathBuf::from(p),
        _ => default_data_dir().join("settings.json"),
    }
}

/// Load and normalize settings. A missing file yields defaults; a file that
/// exists but does not parse is an error rather than silently ignored.
pub fn load_settings(path: &Path) -> anyhow::Result<AppSettings> {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<AppSettings>(&raw)
            .with_context(|| format!("invalid settings file {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            return Err(e).with_context(|| format!("cannot read settings file {}", path.display()))
        }
    };
    settings.normalize();
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
