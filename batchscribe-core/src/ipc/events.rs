//! Events emitted on the orchestrator's broadcast channel.
//!
//! | Event | When |
//! |-------|------|
//! | `BatchEvent::ModelLoaded` | a model finished `load` |
//! | `BatchEvent::ModelLoadFailed` | `load` failed; its items are skipped |
//! | `BatchEvent::Item` | one (model, item) pair reached a final state |
//! | `BatchEvent::ModelReleased` | the model's handle was released |
//! | `BatchEvent::RunFinished` | the report was written |

use serde::{Deserialize, Serialize};

/// Terminal state of one (model, item) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    /// An artifact already existed before this run.
    Skipped,
    /// Transcript written.
    Success,
    /// Deadline passed; recorded in the report.
    TimedOut,
    /// Backend error; no artifact, retried next run.
    Failed,
    /// Not attempted: the engine was still occupied by an abandoned call.
    Deferred,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BatchEvent {
    #[serde(rename_all = "camelCase")]
    ModelLoaded {
        seq: u64,
        model_id: String,
        load_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    ModelLoadFailed {
        seq: u64,
        model_id: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Item {
        seq: u64,
        model_id: String,
        item_id: String,
        outcome: TaskOutcome,
        /// Wall-clock time spent on inference (0 for skipped/deferred).
        elapsed_ms: u64,
        /// Error text for failures.
        detail: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ModelReleased {
        seq: u64,
        model_id: String,
        deferred: bool,
    },
    #[serde(rename_all = "camelCase")]
    RunFinished { seq: u64, total_timeouts: usize },
}

impl BatchEvent {
    pub fn seq(&self) -> u64 {
        match self {
            BatchEvent::ModelLoaded { seq, .. }
            | BatchEvent::ModelLoadFailed { seq, .. }
            | BatchEvent::Item { seq, .. }
            | BatchEvent::ModelReleased { seq, .. }
            | BatchEvent::RunFinished { seq, .. } => *seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_event_serializes_with_tag_and_camel_case() {
        let event = BatchEvent::Item {
            seq: 7,
            model_id: "m1".into(),
            item_id: "b".into(),
            outcome: TaskOutcome::TimedOut,
            elapsed_ms: 60_000,
            detail: None,
        };

        let json = serde_json::to_value(&event).expect("serialize item event");
        assert_eq!(json["event"], "item");
        assert_eq!(json["modelId"], "m1");
        assert_eq!(json["itemId"], "b");
        assert_eq!(json["outcome"], "timedout");
        assert_eq!(json["elapsedMs"], 60_000);

        let round_trip: BatchEvent = serde_json::from_value(json).expect("deserialize item event");
        assert_eq!(round_trip.seq(), 7);
    }

    #[test]
    fn load_failure_event_carries_reason() {
        let event = BatchEvent::ModelLoadFailed {
            seq: 1,
            model_id: "m2".into(),
            reason: "missing weights".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize load failure");
        assert_eq!(json["event"], "modelLoadFailed");
        assert_eq!(json["reason"], "missing weights");
    }

    #[test]
    fn outcome_rejects_non_lowercase_values() {
        assert!(serde_json::from_str::<TaskOutcome>(r#""Success""#).is_err());
        assert_eq!(
            serde_json::from_str::<TaskOutcome>(r#""success""#).unwrap(),
            TaskOutcome::Success
        );
    }
}
