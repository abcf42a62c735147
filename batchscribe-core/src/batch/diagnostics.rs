use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::ipc::events::TaskOutcome;

/// Run-wide counters, readable while a batch is in progress.
#[derive(Default)]
pub struct BatchDiagnostics {
    pub models_loaded: AtomicUsize,
    pub models_failed: AtomicUsize,
    pub models_released: AtomicUsize,
    pub inference_calls: AtomicUsize,
    pub artifacts_written: AtomicUsize,
    pub items_skipped: AtomicUsize,
    pub items_succeeded: AtomicUsize,
    pub items_timed_out: AtomicUsize,
    pub items_failed: AtomicUsize,
    pub items_deferred: AtomicUsize,
}

impl BatchDiagnostics {
    pub fn reset(&self) {
        for counter in [
            &self.models_loaded,
            &self.models_failed,
            &self.models_released,
            &self.inference_calls,
            &self.artifacts_written,
            &self.items_skipped,
            &self.items_succeeded,
            &self.items_timed_out,
            &self.items_failed,
            &self.items_deferred,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn record_outcome(&self, outcome: TaskOutcome) {
        let counter = match outcome {
            TaskOutcome::Skipped => &self.items_skipped,
            TaskOutcome::Success => &self.items_succeeded,
            TaskOutcome::TimedOut => &self.items_timed_out,
            TaskOutcome::Failed => &self.items_failed,
            TaskOutcome::Deferred => &self.items_deferred,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            models_loaded: self.models_loaded.load(Ordering::Relaxed),
            models_failed: self.models_failed.load(Ordering::Relaxed),
            models_released: self.models_released.load(Ordering::Relaxed),
            inference_calls: self.inference_calls.load(Ordering::Relaxed),
            artifacts_written: self.artifacts_written.load(Ordering::Relaxed),
            items_skipped: self.items_skipped.load(Ordering::Relaxed),
            items_succeeded: self.items_succeeded.load(Ordering::Relaxed),
            items_timed_out: self.items_timed_out.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            items_deferred: self.items_deferred.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub models_loaded: usize,
    pub models_failed: usize,
    pub models_released: usize,
    pub inference_calls: usize,
    pub artifacts_written: usize,
    pub items_skipped: usize,
    pub items_succeeded: usize,
    pub items_timed_out: usize,
    pub items_failed: usize,
    pub items_deferred: usize,
}
