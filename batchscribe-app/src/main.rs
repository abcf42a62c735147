//! batchscribe command-line entry point.
//!
//! Settings come from the JSON file (see `settings`), then CLI flags
//! override them for this invocation. External tools are resolved once
//! here, before any model is loaded.

mod settings;
mod status;

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use batchscribe_core::inference::command::{CommandTemplate, ToolPaths};
use batchscribe_core::{
    BackendLoader, BackendOptions, BatchConfig, BatchEvent, BatchOrchestrator, Device,
    LanguageHint, ModelSpec, TimeoutPolicy,
};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

use settings::{default_settings_path, load_settings, save_settings, AppSettings};

#[derive(Parser)]
#[command(name = "batchscribe")]
#[command(version, about = "Resumable batch transcription across several speech models", long_about = None)]
struct Cli {
    /// Settings file (default: $BATCHSCRIBE_SETTINGS or the user data dir)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Default)]
struct Overrides {
    /// Directory holding the audio items
    #[arg(long)]
    input: Option<PathBuf>,

    /// Root of the per-model transcript directories
    #[arg(long)]
    output: Option<PathBuf>,

    /// Model to run, `<backend>:<id>` or a bare hub id (repeatable, in order)
    #[arg(long = "model", short = 'm')]
    models: Vec<String>,

    /// cpu or accelerator
    #[arg(long)]
    device: Option<String>,

    /// Language for every item (ISO-639-1 code, name, or `auto`)
    #[arg(long)]
    language: Option<String>,

    /// Per-item inference deadline in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// markDone (write the sentinel) or retry (leave the item pending)
    #[arg(long)]
    timeout_policy: Option<String>,

    /// Text written in place of a timed-out transcript
    #[arg(long)]
    marker: Option<String>,

    /// Never fetch missing ONNX model files
    #[arg(long, default_value_t = false)]
    no_download: bool,

    /// Path to the external recognizer executable
    #[arg(long)]
    recognizer: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Transcribe every pending (model, item) pair
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// Print progress events as JSON lines on stdout
        #[arg(long, default_value_t = false)]
        events: bool,
    },
    /// Show per-model progress from the result store
    Status {
        #[command(flatten)]
        overrides: Overrides,

        /// Print as JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the effective settings, optionally saving them
    Settings {
        #[command(flatten)]
        overrides: Overrides,

        #[arg(long, default_value_t = false)]
        save: bool,
    },
}

impl Overrides {
    fn apply(self, settings: &mut AppSettings) {
        if let Some(v) = self.input {
            settings.input_dir = v;
        }
        if let Some(v) = self.output {
            settings.output_root = v;
        }
        if !self.models.is_empty() {
            settings.models = self.models;
        }
        if let Some(v) = self.device {
            settings.device = v;
        }
        if let Some(v) = self.language {
            settings.language = v;
        }
        if let Some(v) = self.timeout {
            settings.timeout_secs = v;
        }
        if let Some(v) = self.timeout_policy {
            settings.timeout_policy = v;
        }
        if let Some(v) = self.marker {
            settings.timeout_marker = v;
        }
        if self.no_download {
            settings.allow_download = false;
        }
        if let Some(v) = self.recognizer {
            settings.recognizer_path = Some(v);
        }
        settings.normalize();
    }
}

fn model_specs(settings: &AppSettings) -> anyhow::Result<Vec<ModelSpec>> {
    let device: Device = settings.device.parse()?;
    settings
        .models
        .iter()
        .map(|raw| {
            raw.parse::<ModelSpec>()
                .map(|spec| spec.with_device(device))
                .with_context(|| format!("invalid model {raw:?}"))
        })
        .collect()
}

fn batch_config(settings: &AppSettings) -> anyhow::Result<BatchConfig> {
    let language: LanguageHint = settings.language.parse()?;
    let timeout_policy: TimeoutPolicy = settings.timeout_policy.parse()?;
    Ok(BatchConfig {
        input_dir: settings.input_dir.clone(),
        output_root: settings.output_root.clone(),
        report_path: settings.report_path.clone(),
        models: model_specs(settings)?,
        language,
        timeout: Duration::from_secs(settings.timeout_secs),
        timeout_policy,
        timeout_marker: settings.timeout_marker.clone(),
        busy_grace: Duration::from_secs(settings.busy_grace_secs),
    })
}

fn backend_options(settings: &AppSettings) -> BackendOptions {
    let tools = ToolPaths::resolve(
        settings.recognizer_path.as_deref(),
        &settings.recognizer_name,
        &settings.tool_search_dirs,
    );
    let command_template = if settings.command_args.is_empty() {
        CommandTemplate::default()
    } else {
        CommandTemplate {
            args: settings.command_args.clone(),
            cpu_args: Vec::new(),
        }
    };
    BackendOptions {
        models_root: settings.models_root.clone(),
        allow_download: settings.allow_download,
        hub_url: settings.hub_url.clone(),
        tools,
        command_template,
    }
}

/// Forward events to stdout until the orchestrator drops its sender.
fn spawn_event_printer(mut rx: broadcast::Receiver<BatchEvent>) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        match rx.blocking_recv() {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "could not serialize event"),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    })
}

fn run_batch(settings: &AppSettings, print_events: bool) -> anyhow::Result<()> {
    let config = batch_config(settings)?;
    let loader = BackendLoader::new(backend_options(settings));
    let orchestrator = BatchOrchestrator::new(config, loader);
    let printer = print_events.then(|| spawn_event_printer(orchestrator.subscribe()));

    let result = orchestrator.run();
    let diagnostics = orchestrator.diagnostics_snapshot();
    drop(orchestrator);
    if let Some(printer) = printer {
        let _ = printer.join();
    }

    let summary = result.context("batch run failed")?;
    // Keep stdout machine-readable when streaming events.
    if print_events {
        eprint!("{}", summary.report.digest());
    } else {
        print!("{}", summary.report.digest());
    }
    info!(
        items = summary.item_count,
        attempted = summary.attempted(),
        report = ?summary.report_path,
        ?diagnostics,
        "run complete"
    );
    for model in summary.models.iter().filter(|m| m.load_error.is_some()) {
        warn!(model = %model.model_id, reason = ?model.load_error, "model was skipped");
    }
    Ok(())
}

fn real_main(cli: Cli) -> anyhow::Result<()> {
    let settings_path = cli.settings.unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path)?;
    info!(settings_path = ?settings_path, "settings loaded");

    match cli.command {
        Commands::Run { overrides, events } => {
            overrides.apply(&mut settings);
            run_batch(&settings, events)
        }
        Commands::Status { overrides, json } => {
            overrides.apply(&mut settings);
            let statuses = status::collect(
                &settings.input_dir,
                &settings.output_root,
                &model_specs(&settings)?,
                &settings.timeout_marker,
            )?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                print!("{}", status::render(&statuses));
            }
            Ok(())
        }
        Commands::Settings { overrides, save } => {
            overrides.apply(&mut settings);
            batch_config(&settings).context("invalid settings")?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if save {
                save_settings(&settings_path, &settings)
                    .with_context(|| format!("cannot write {}", settings_path.display()))?;
                info!(settings_path = ?settings_path, "settings saved");
            }
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("batchscribe=info")),
        )
        .init();

    match real_main(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::try_parse_from([
            "batchscribe",
            "run",
            "-m",
            "stub:m1",
            "--model",
            "openai/whisper-small",
            "--device",
            "gpu",
            "--timeout",
            "5",
            "--timeout-policy",
            "retry",
        ])
        .unwrap();
        let Commands::Run { overrides, .. } = cli.command else {
            panic!("expected run");
        };
        let mut settings = AppSettings::default();
        overrides.apply(&mut settings);

        let config = batch_config(&settings).unwrap();
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.models[0].id, "m1");
        assert!(config.models.iter().all(|m| m.device == Device::Accelerator));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.timeout_policy, TimeoutPolicy::Retry);
        assert_eq!(config.language.code(), Some("nl"));
    }

    #[test]
    fn mistyped_policy_and_device_are_rejected() {
        let cli = Cli::try_parse_from([
            "batchscribe",
            "run",
            "-m",
            "stub:m1",
            "--timeout-policy",
            "retyr",
        ])
        .unwrap();
        let Commands::Run { overrides, .. } = cli.command else {
            panic!("expected run");
        };
        let mut settings = AppSettings::default();
        overrides.apply(&mut settings);
        let err = batch_config(&settings).unwrap_err();
        assert!(err.to_string().contains("retyr"), "{err}");

        let settings = AppSettings {
            device: "gpu0".into(),
            models: vec!["stub:m1".into()],
            ..AppSettings::default()
        };
        assert!(batch_config(&settings).is_err());
    }

    #[test]
    fn invalid_language_is_rejected() {
        let settings = AppSettings {
            language: "not a language".into(),
            models: vec!["stub:m1".into()],
            ..AppSettings::default()
        };
        assert!(batch_config(&settings).is_err());
    }
}
