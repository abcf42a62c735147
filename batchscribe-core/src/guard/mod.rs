//! Wall-clock deadline around one blocking call.
//!
//! The call runs on its own named worker thread and the caller waits on a
//! one-slot channel. On expiry the caller stops waiting and the worker is
//! left to finish on its own: its result goes into a channel nobody reads
//! and is dropped. The guard kills nothing, so a worker holding locks or
//! device memory unwinds normally whenever it returns. Callers that can
//! cancel the underlying work (see `ModelHandle::interrupt`) do so on
//! `TimedOut`.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, warn};

use crate::error::{Result, ScribeError};

/// Source default: one minute per item.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a guarded call.
#[derive(Debug, PartialEq, Eq)]
pub enum GuardOutcome<T> {
    /// Returned within the deadline.
    Completed { value: T, elapsed: Duration },
    /// Deadline passed; the worker was abandoned.
    TimedOut { after: Duration },
}

impl<T> GuardOutcome<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, GuardOutcome::TimedOut { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    timeout: Duration,
}

impl Default for TimeoutGuard {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TimeoutGuard {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `f` on a worker thread named `label`, waiting at most the
    /// configured timeout.
    ///
    /// # Errors
    /// - `ScribeError::Io` if the worker thread cannot be spawned.
    /// - `ScribeError::WorkerPanicked` if `f` panicked before returning.
    pub fn run<T, F>(&self, label: &str, f: F) -> Result<GuardOutcome<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        // Capacity 1: a late worker's send never blocks, it just fails once
        // the receiver is gone.
        let (tx, rx) = crossbeam_channel::bounded::<T>(1);
        let start = Instant::now();

        thread::Builder::new()
            .name(format!("infer-{label}"))
            .spawn(move || {
                let value = f();
                if tx.send(value).is_err() {
                    debug!("guarded call finished after its deadline; result discarded");
                }
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok(value) => Ok(GuardOutcome::Completed {
                value,
                elapsed: start.elapsed(),
            }),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    label,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "guarded call exceeded its deadline; abandoning worker"
                );
                Ok(GuardOutcome::TimedOut {
                    after: start.elapsed(),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(ScribeError::WorkerPanicked),
        }
    }
}

/// Free-function form of [`TimeoutGuard::run`].
pub fn run_with_timeout<T, F>(timeout: Duration, label: &str, f: F) -> Result<GuardOutcome<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    TimeoutGuard::new(timeout).run(label, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[test]
    fn fast_call_completes() {
        let out = run_with_timeout(Duration::from_secs(2), "fast", || 41 + 1).unwrap();
        match out {
            GuardOutcome::Completed { value, elapsed } => {
                assert_eq!(value, 42);
                assert!(elapsed < Duration::from_secs(2));
            }
            GuardOutcome::TimedOut { .. } => panic!("should not time out"),
        }
    }

    #[test]
    fn slow_call_times_out_promptly() {
        let start = Instant::now();
        let out = run_with_timeout(Duration::from_millis(50), "slow", || {
            thread::sleep(Duration::from_secs(2));
            "late"
        })
        .unwrap();
        assert!(out.is_timed_out());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn abandoned_worker_still_runs_to_completion() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let out = run_with_timeout(Duration::from_millis(20), "abandoned", move || {
            thread::sleep(Duration::from_millis(150));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(out.is_timed_out());
        assert!(!finished.load(Ordering::SeqCst));

        thread::sleep(Duration::from_millis(400));
        assert!(finished.load(Ordering::SeqCst), "worker should finish on its own");
    }

    #[test]
    fn panicking_call_is_reported() {
        let err = run_with_timeout(Duration::from_secs(2), "panics", || -> u8 {
            panic!("backend blew up")
        })
        .unwrap_err();
        assert!(matches!(err, ScribeError::WorkerPanicked));
    }

    #[test]
    fn default_is_sixty_seconds() {
        assert_eq!(TimeoutGuard::default().timeout(), Duration::from_secs(60));
    }
}
