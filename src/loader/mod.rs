// Module: Loader
// Reads hydrated suite snapshots (JSON) from disk and keeps the ones a
// server process serves runs from. The catalog that edits entities
// lives elsewhere; this side only consumes its export format.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::limits::ExecutionLimits;
use crate::protocol::SuiteSnapshot;
use crate::validation;

/// Loads and checks a single snapshot file.
pub fn load_snapshot_from_file<P: AsRef<Path>>(
    path: P,
    limits: &ExecutionLimits,
) -> Result<SuiteSnapshot> {
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read snapshot '{}'", path.as_ref().display()))?;
    let snapshot: SuiteSnapshot =
        serde_json::from_str(&content).context("failed to parse snapshot JSON")?;

    if snapshot.suite.steps.len() > limits.max_steps {
        bail!(
            "suite '{}' has {} steps, limit is {}",
            snapshot.suite.name,
            snapshot.suite.steps.len(),
            limits.max_steps
        );
    }

    // The 50 MiB upload cap applies to each stored file. Base64 inflates
    // by 4/3, so check the decoded size.
    for environment in &snapshot.environments {
        for file in &environment.files {
            let decoded_len = file.data.len() / 4 * 3;
            if decoded_len as u64 > limits.max_upload_bytes {
                bail!(
                    "file '{}' in environment '{}' exceeds the {} byte upload limit",
                    file.file_key,
                    environment.name,
                    limits.max_upload_bytes
                );
            }
        }
    }

    if let Err(errors) = validation::validate_snapshot(&snapshot) {
        let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        bail!("snapshot failed validation: {}", joined.join("; "));
    }

    Ok(snapshot)
}

/// In-memory set of snapshots a server process can run.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: HashMap<Uuid, SuiteSnapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.json` in a directory. Files that fail to load are
    /// reported as errors; one bad file fails the whole load so a
    /// server never boots with a partial catalog.
    pub fn load_dir<P: AsRef<Path>>(dir: P, limits: &ExecutionLimits) -> Result<Self> {
        let mut store = Self::new();
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("failed to read snapshot dir '{}'", dir.as_ref().display()))?;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let snapshot = load_snapshot_from_file(&path, limits)?;
            store.insert(snapshot);
        }
        Ok(store)
    }

    pub fn insert(&mut self, snapshot: SuiteSnapshot) {
        self.snapshots.insert(snapshot.suite.id, snapshot);
    }

    pub fn get(&self, suite_id: Uuid) -> Option<&SuiteSnapshot> {
        self.snapshots.get(&suite_id)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
