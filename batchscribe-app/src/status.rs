//! `batchscribe status`: per-model progress straight from the result store.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context;
use batchscribe_core::{list_items, ModelSpec, ModelStatus, ResultStore};

pub fn collect(
    input_dir: &Path,
    output_root: &Path,
    models: &[ModelSpec],
    timeout_marker: &str,
) -> anyhow::Result<Vec<ModelStatus>> {
    let items = list_items(input_dir)
        .with_context(|| format!("cannot list items in {}", input_dir.display()))?;
    let store = ResultStore::new(output_root);
    models
        .iter()
        .map(|spec| {
            store
                .status(&spec.id, &items, timeout_marker)
                .with_context(|| format!("cannot read artifacts for {}", spec.id))
        })
        .collect()
}

pub fn render(statuses: &[ModelStatus]) -> String {
    let mut out = String::new();
    let width = statuses
        .iter()
        .map(|s| s.model_id.len())
        .max()
        .unwrap_or(5)
        .max(5);
    let _ = writeln!(
        out,
        "{:<width$}  {:>6}  {:>6}  {:>8}  {:>7}  {:>8}",
        "model", "total", "done", "timeouts", "pending", "words"
    );
    for s in statuses {
        let _ = writeln!(
            out,
            "{:<width$}  {:>6}  {:>6}  {:>8}  {:>7}  {:>8}",
            s.model_id, s.total, s.done, s.timeouts, s.pending, s.words
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchscribe_core::{BackendKind, Device};

    #[test]
    fn counts_done_timeouts_and_pending() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("in");
        let output = tmp.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        for name in ["a.wav", "b.wav", "c.wav"] {
            std::fs::write(input.join(name), b"").unwrap();
        }
        let store = ResultStore::new(&output);
        store.write("org/m1", "a", "two words").unwrap();
        store.write("org/m1", "b", "None").unwrap();

        let models = [ModelSpec::new("org/m1", BackendKind::Stub, Device::Cpu)];
        let statuses = collect(&input, &output, &models, "None").unwrap();
        let s = &statuses[0];
        assert_eq!((s.total, s.done, s.timeouts, s.pending, s.words), (3, 2, 1, 1, 2));

        let table = render(&statuses);
        assert!(table.lines().nth(1).unwrap().starts_with("org/m1"));
    }
}
