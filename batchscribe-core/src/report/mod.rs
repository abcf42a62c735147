//! Per-run timeout report.
//!
//! Built fresh every run and written once at the end, overwriting the
//! previous run's file:
//!
//! ```json
//! {
//!   "timestamp": "2024-05-01 14:03:22",
//!   "timeouts": {
//!     "openai/whisper-small": ["b", "f"],
//!     "m2": []
//!   }
//! }
//! ```
//!
//! Models appear in processing order, each with its timed-out item ids in
//! the order they timed out.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Result, ScribeError};

pub const REPORT_FILE_NAME: &str = "timeout_files.json";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTimeouts {
    pub model_id: String,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Local time the run started.
    pub timestamp: String,
    #[serde(with = "ordered_map")]
    pub timeouts: Vec<ModelTimeouts>,
}

impl RunReport {
    pub fn new(started_at: DateTime<Local>) -> Self {
        Self {
            timestamp: started_at.format(TIMESTAMP_FORMAT).to_string(),
            timeouts: Vec::new(),
        }
    }

    /// Register a model so it shows up in the report even with no timeouts.
    pub fn begin_model(&mut self, model_id: &str) {
        self.entry(model_id);
    }

    pub fn record_timeout(&mut self, model_id: &str, item_id: &str) {
        self.entry(model_id).items.push(item_id.to_string());
    }

    pub fn timeouts_for(&self, model_id: &str) -> &[String] {
        self.timeouts
            .iter()
            .find(|m| m.model_id == model_id)
            .map(|m| m.items.as_slice())
            .unwrap_or(&[])
    }

    pub fn total_timeouts(&self) -> usize {
        self.timeouts.iter().map(|m| m.items.len()).sum()
    }

    fn entry(&mut self, model_id: &str) -> &mut ModelTimeouts {
        let idx = match self.timeouts.iter().position(|m| m.model_id == model_id) {
            Some(idx) => idx,
            None => {
                self.timeouts.push(ModelTimeouts {
                    model_id: model_id.to_string(),
                    items: Vec::new(),
                });
                self.timeouts.len() - 1
            }
        };
        &mut self.timeouts[idx]
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ScribeError::Other(e.into()))
    }

    /// Serialize and write the report to `path`, replacing any previous file.
    ///
    /// # Errors
    /// `ScribeError::Persistence` when the file cannot be written.
    pub fn finalize(&self, path: &Path) -> Result<String> {
        let json = self.to_json()?;
        let persist_err = |source: std::io::Error| ScribeError::Persistence {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(persist_err)?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(persist_err)?;
        tmp.write_all(json.as_bytes()).map_err(persist_err)?;
        tmp.persist(path).map_err(|e| persist_err(e.error))?;
        Ok(json)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| ScribeError::Other(e.into()))
    }

    /// Human-readable summary listing only models with at least one timeout.
    pub fn digest(&self) -> String {
        let mut out = String::from("\nTimeout Summary:\n================\n");
        let mut any = false;
        for model in self.timeouts.iter().filter(|m| !m.items.is_empty()) {
            any = true;
            let _ = writeln!(out, "\nModel: {}", model.model_id);
            let _ = writeln!(out, "Items that timed out:");
            for item in &model.items {
                let _ = writeln!(out, "- {item}");
            }
        }
        if !any {
            out.push_str("\nNo timeouts.\n");
        }
        out
    }
}

/// `Vec<ModelTimeouts>` as a JSON object, preserving insertion order.
mod ordered_map {
    use std::fmt;

    use serde::de::{MapAccess, Visitor};
    use serde::{Deserializer, Serializer};

    use super::ModelTimeouts;

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(
        value: &Vec<ModelTimeouts>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(value.iter().map(|m| (&m.model_id, &m.items)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<ModelTimeouts>, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = Vec<ModelTimeouts>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of model id to timed-out item ids")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::new();
                while let Some((model_id, items)) = map.next_entry::<String, Vec<String>>()? {
                    out.push(ModelTimeouts { model_id, items });
                }
                Ok(out)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}
