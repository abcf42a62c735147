//! Progress types broadcast by the batch orchestrator.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so hosts can
//! print them as JSON lines or forward them elsewhere.

pub mod events;
