//! `BatchOrchestrator` runs every (model, item) pair once.
//!
//! ## Lifecycle
//!
//! ```text
//! run()
//!  ├─ list_items(input_dir)                 fatal if the directory is missing
//!  ├─ for model in models (caller order)
//!  │    ├─ every pair already stored?       → all Skipped, model never loaded
//!  │    ├─ load()                           failure → skip model, continue
//!  │    ├─ for item in items (sorted)
//!  │    │    ├─ artifact exists             → Skipped
//!  │    │    ├─ engine wedged               → Deferred
//!  │    │    └─ TimeoutGuard(transcribe)
//!  │    │         ├─ Ok(text)               → write text        Success
//!  │    │         ├─ deadline               → write sentinel    TimedOut
//!  │    │         └─ Err / panic            → nothing written   Failed
//!  │    └─ release()                        always, even after a fatal error
//!  └─ report.finalize()
//! ```
//!
//! Timeouts and failures are deliberately asymmetric: a timed-out pair is
//! marked done (unless `TimeoutPolicy::Retry`), a failed pair is retried by
//! the next run.
//!
//! ## Threading
//!
//! Strictly sequential: one model loaded at a time, one item in flight. The
//! only extra threads are the guard's inference workers. At the deadline the
//! backend is interrupted when it supports that (the command backend kills
//! its child). Otherwise the abandoned worker keeps the engine's mutex until
//! it returns, so before each
//! dispatch the orchestrator waits up to `busy_grace` for the engine to go
//! idle and defers the model's remaining items if it does not.

pub mod diagnostics;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, info_span, warn};

use crate::{
    catalog::{self, AudioItem},
    error::{Result, ScribeError},
    guard::{GuardOutcome, TimeoutGuard, DEFAULT_TIMEOUT},
    inference::{LanguageHint, ModelHandle, ModelLoader, ModelSpec, ReleaseMode},
    ipc::events::{BatchEvent, TaskOutcome},
    report::{RunReport, REPORT_FILE_NAME},
    store::{model_dir_name, ResultStore},
};

use self::diagnostics::{BatchDiagnostics, DiagnosticsSnapshot};

/// Broadcast channel capacity: events buffered for slow subscribers.
const BROADCAST_CAP: usize = 1024;

/// Text written in place of a transcript when inference times out.
pub const DEFAULT_TIMEOUT_MARKER: &str = "None";

/// What a timeout leaves behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeoutPolicy {
    /// Write the sentinel artifact; later runs skip the pair.
    #[default]
    MarkDone,
    /// Report the timeout but write nothing; later runs try again.
    Retry,
}

impl FromStr for TimeoutPolicy {
    type Err = ScribeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdone" | "mark-done" | "done" | "sentinel" => Ok(TimeoutPolicy::MarkDone),
            "retry" => Ok(TimeoutPolicy::Retry),
            other => Err(ScribeError::Config(format!("unknown timeout policy: {other}"))),
        }
    }
}

/// Configuration for `BatchOrchestrator`.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Directory holding the audio items. Must exist.
    pub input_dir: PathBuf,
    /// Root of the result store (one subdirectory per model).
    pub output_root: PathBuf,
    /// Run report location. `None` → `<output_root>/timeout_files.json`.
    pub report_path: Option<PathBuf>,
    /// Models in processing order.
    pub models: Vec<ModelSpec>,
    /// Language passed to every inference call.
    pub language: LanguageHint,
    /// Per-item inference deadline. Default: 60 s.
    pub timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
    /// Sentinel artifact text. Default: `"None"`.
    pub timeout_marker: String,
    /// How long to wait for an abandoned call to release the engine before
    /// deferring the model's remaining items. Default: 30 s.
    pub busy_grace: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("output").join("segments"),
            output_root: PathBuf::from("output").join("transcripts"),
            report_path: None,
            models: Vec::new(),
            language: LanguageHint::Code("nl".into()),
            timeout: DEFAULT_TIMEOUT,
            timeout_policy: TimeoutPolicy::MarkDone,
            timeout_marker: DEFAULT_TIMEOUT_MARKER.into(),
            busy_grace: Duration::from_secs(30),
        }
    }
}

impl BatchConfig {
    pub fn report_path(&self) -> PathBuf {
        self.report_path
            .clone()
            .unwrap_or_else(|| self.output_root.join(REPORT_FILE_NAME))
    }

    /// Reject configurations that would make the store ambiguous.
    ///
    /// # Errors
    /// `ScribeError::Config` for no models, a zero timeout, an empty
    /// sentinel, or two models sharing an output directory.
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(ScribeError::Config("no models to run".into()));
        }
        if self.timeout.is_zero() {
            return Err(ScribeError::Config("timeout must be positive".into()));
        }
        if self.timeout_marker.is_empty() {
            return Err(ScribeError::Config("timeout marker must not be empty".into()));
        }
        let mut dirs = std::collections::HashMap::new();
        for spec in &self.models {
            let dir = model_dir_name(&spec.id);
            if let Some(other) = dirs.insert(dir.clone(), spec.id.as_str()) {
                return Err(ScribeError::Config(format!(
                    "models {other} and {} both write to {dir}/",
                    spec.id
                )));
            }
        }
        Ok(())
    }
}

/// Outcome counts for one model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSummary {
    pub model_id: String,
    pub loaded: bool,
    pub load_error: Option<String>,
    pub release_deferred: bool,
    pub skipped: usize,
    pub succeeded: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub deferred: usize,
}

impl ModelSummary {
    fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            ..Self::default()
        }
    }

    fn count(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::Success => self.succeeded += 1,
            TaskOutcome::TimedOut => self.timed_out += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::Deferred => self.deferred += 1,
        }
    }

    /// Pairs that went through the timeout guard.
    pub fn attempted(&self) -> usize {
        self.succeeded + self.timed_out + self.failed
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub report: RunReport,
    pub report_path: PathBuf,
    pub models: Vec<ModelSummary>,
    pub item_count: usize,
}

impl RunSummary {
    pub fn attempted(&self) -> usize {
        self.models.iter().map(ModelSummary::attempted).sum()
    }
}

/// Result of one guarded attempt, before it is persisted.
struct Attempt {
    outcome: TaskOutcome,
    elapsed: Duration,
    detail: Option<String>,
}

pub struct BatchOrchestrator<L: ModelLoader> {
    config: BatchConfig,
    loader: L,
    store: ResultStore,
    guard: TimeoutGuard,
    event_tx: broadcast::Sender<BatchEvent>,
    seq: AtomicU64,
    diagnostics: Arc<BatchDiagnostics>,
}

impl<L: ModelLoader> BatchOrchestrator<L> {
    pub fn new(config: BatchConfig, loader: L) -> Self {
        let (event_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            store: ResultStore::new(config.output_root.clone()),
            guard: TimeoutGuard::new(config.timeout),
            config,
            loader,
            event_tx,
            seq: AtomicU64::new(0),
            diagnostics: Arc::new(BatchDiagnostics::default()),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.event_tx.subscribe()
    }

    pub fn diagnostics(&self) -> Arc<BatchDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Process every (model, item) pair, then write the run report.
    ///
    /// # Errors
    /// Setup failures (invalid config, missing input directory) before any
    /// work, and persistence failures, which halt the run after the current
    /// model is released and a partial report is written.
    pub fn run(&self) -> Result<RunSummary> {
        self.config.validate()?;
        self.diagnostics.reset();

        let mut report = RunReport::new(Local::now());
        let items = catalog::list_items(&self.config.input_dir)?;
        let report_path = self.config.report_path();
        info!(
            items = items.len(),
            models = self.config.models.len(),
            input = ?self.config.input_dir,
            output = ?self.config.output_root,
            timeout_s = self.config.timeout.as_secs_f64(),
            language = %self.config.language,
            "batch started"
        );

        let mut models = Vec::with_capacity(self.config.models.len());
        for spec in &self.config.models {
            report.begin_model(&spec.id);
            match self.run_model(spec, &items, &mut report) {
                Ok(summary) => models.push(summary),
                Err(e) => {
                    error!(model = %spec.id, error = %e, "batch halted");
                    if let Err(report_err) = report.finalize(&report_path) {
                        error!(error = %report_err, "could not write partial run report");
                    }
                    return Err(e);
                }
            }
        }

        report.finalize(&report_path)?;
        let total_timeouts = report.total_timeouts();
        info!(
            report = ?report_path,
            total_timeouts,
            diagnostics = ?self.diagnostics.snapshot(),
            "batch finished"
        );
        self.emit(|seq| BatchEvent::RunFinished {
            seq,
            total_timeouts,
        });

        Ok(RunSummary {
            report,
            report_path,
            models,
            item_count: items.len(),
        })
    }

    fn run_model(
        &self,
        spec: &ModelSpec,
        items: &[AudioItem],
        report: &mut RunReport,
    ) -> Result<ModelSummary> {
        let span = info_span!("model", model = %spec.id, backend = %spec.backend);
        let _enter = span.enter();
        let mut summary = ModelSummary::new(&spec.id);

        if items.iter().all(|item| self.store.exists(&spec.id, &item.id)) {
            info!(items = items.len(), "every item already transcribed; not loading model");
            for item in items {
                self.finish_item(spec, item, &mut summary, Attempt::skipped());
            }
            return Ok(summary);
        }

        let load_start = Instant::now();
        let handle = match self.loader.load(spec) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "model failed to load; skipping its items");
                self.diagnostics.models_failed.fetch_add(1, Ordering::Relaxed);
                let reason = e.to_string();
                self.emit(|seq| BatchEvent::ModelLoadFailed {
                    seq,
                    model_id: spec.id.clone(),
                    reason: reason.clone(),
                });
                summary.load_error = Some(reason);
                return Ok(summary);
            }
        };
        let load_ms = load_start.elapsed().as_millis() as u64;
        info!(load_ms, "model loaded");
        summary.loaded = true;
        self.diagnostics.models_loaded.fetch_add(1, Ordering::Relaxed);
        self.emit(|seq| BatchEvent::ModelLoaded {
            seq,
            model_id: spec.id.clone(),
            load_ms,
        });

        let result = self.process_items(spec, &handle, items, report, &mut summary);

        // Unconditional: frees device memory before the next model loads.
        let mode = self.loader.release(handle);
        summary.release_deferred = mode == ReleaseMode::Deferred;
        self.diagnostics.models_released.fetch_add(1, Ordering::Relaxed);
        self.emit(|seq| BatchEvent::ModelReleased {
            seq,
            model_id: spec.id.clone(),
            deferred: summary.release_deferred,
        });

        info!(
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            timed_out = summary.timed_out,
            failed = summary.failed,
            deferred = summary.deferred,
            "model finished"
        );
        result.map(|()| summary)
    }

    fn process_items(
        &self,
        spec: &ModelSpec,
        handle: &ModelHandle,
        items: &[AudioItem],
        report: &mut RunReport,
        summary: &mut ModelSummary,
    ) -> Result<()> {
        let mut wedged = false;

        for item in items {
            if self.store.exists(&spec.id, &item.id) {
                self.finish_item(spec, item, summary, Attempt::skipped());
                continue;
            }
            if !wedged && handle.is_busy() && !handle.wait_idle(self.config.busy_grace) {
                error!(
                    grace_s = self.config.busy_grace.as_secs_f64(),
                    "engine still occupied by an abandoned call; deferring remaining items"
                );
                wedged = true;
            }
            if wedged {
                self.finish_item(spec, item, summary, Attempt::deferred());
                continue;
            }

            let attempt = self.attempt(spec, handle, item, report)?;
            self.finish_item(spec, item, summary, attempt);
        }
        Ok(())
    }

    /// Run one inference under the guard and persist its outcome.
    fn attempt(
        &self,
        spec: &ModelSpec,
        handle: &ModelHandle,
        item: &AudioItem,
        report: &mut RunReport,
    ) -> Result<Attempt> {
        self.diagnostics.inference_calls.fetch_add(1, Ordering::Relaxed);

        let worker_handle = handle.clone();
        let audio = item.path.clone();
        let language = self.config.language.clone();
        let label = format!("{}-{}", model_dir_name(&spec.id), item.id);
        let guarded = self
            .guard
            .run(&label, move || worker_handle.transcribe(&audio, &language));

        match guarded {
            Ok(GuardOutcome::Completed {
                value: Ok(text),
                elapsed,
            }) => {
                self.store.write(&spec.id, &item.id, &text)?;
                self.diagnostics.artifacts_written.fetch_add(1, Ordering::Relaxed);
                info!(item = %item.file_name(), elapsed_ms = elapsed.as_millis() as u64, "transcribed");
                Ok(Attempt {
                    outcome: TaskOutcome::Success,
                    elapsed,
                    detail: None,
                })
            }
            Ok(GuardOutcome::Completed {
                value: Err(e),
                elapsed,
            }) => {
                warn!(item = %item.file_name(), error = %e, "transcription failed; will retry next run");
                Ok(Attempt {
                    outcome: TaskOutcome::Failed,
                    elapsed,
                    detail: Some(e.to_string()),
                })
            }
            Ok(GuardOutcome::TimedOut { after }) => {
                let interrupted = handle.interrupt();
                warn!(item = %item.file_name(), interrupted, "timed out; moving to next item");
                report.record_timeout(&spec.id, &item.id);
                if self.config.timeout_policy == TimeoutPolicy::MarkDone {
                    self.store
                        .write(&spec.id, &item.id, &self.config.timeout_marker)?;
                    self.diagnostics.artifacts_written.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Attempt {
                    outcome: TaskOutcome::TimedOut,
                    elapsed: after,
                    detail: None,
                })
            }
            Err(e) => {
                warn!(item = %item.file_name(), error = %e, "inference worker failed; will retry next run");
                Ok(Attempt {
                    outcome: TaskOutcome::Failed,
                    elapsed: Duration::ZERO,
                    detail: Some(e.to_string()),
                })
            }
        }
    }

    fn finish_item(
        &self,
        spec: &ModelSpec,
        item: &AudioItem,
        summary: &mut ModelSummary,
        attempt: Attempt,
    ) {
        summary.count(attempt.outcome);
        self.diagnostics.record_outcome(attempt.outcome);
        self.emit(|seq| BatchEvent::Item {
            seq,
            model_id: spec.id.clone(),
            item_id: item.id.clone(),
            outcome: attempt.outcome,
            elapsed_ms: attempt.elapsed.as_millis() as u64,
            detail: attempt.detail,
        });
    }

    fn emit(&self, build: impl FnOnce(u64) -> BatchEvent) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine.
        let _ = self.event_tx.send(build(seq));
    }
}

impl Attempt {
    fn skipped() -> Self {
        Self {
            outcome: TaskOutcome::Skipped,
            elapsed: Duration::ZERO,
            detail: None,
        }
    }

    fn deferred() -> Self {
        Self {
            outcome: TaskOutcome::Deferred,
            elapsed: Duration::ZERO,
            detail: None,
        }
    }
}
