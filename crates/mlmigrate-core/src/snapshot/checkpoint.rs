//! Per-parent progress: completed and failed child sets, cursor position, and the
//! previous-import file that lets an import resume.

use super::atomic::{atomic_read_json, atomic_write_json};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

/// Outcome of one successful child migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    /// Source ID. Stored as the map key on disk, so not serialized.
    #[serde(default, skip_serializing)]
    pub source_id: String,
    #[serde(rename = "dst_id", alias = "dst_run_id", alias = "destination_id")]
    pub destination_id: String,
    /// Destination artifact root, needed to rebuild model version sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_uri: Option<String>,
    /// Source run ID of the parent run, for nested runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_parent_run_id: Option<String>,
}

impl ChildRecord {
    pub fn new(source_id: impl Into<String>, destination_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            artifact_uri: None,
            src_parent_run_id: None,
        }
    }

    pub fn with_artifact_uri(mut self, uri: Option<String>) -> Self {
        self.artifact_uri = uri;
        self
    }
}

/// In-memory progress of one parent.
///
/// Owned by a single parent migrator. A child ID is never both completed and failed:
/// success clears a previous failure, and a failure is ignored for a completed child.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    completed: Vec<ChildRecord>,
    positions: HashMap<String, usize>,
    failed: Vec<String>,
    /// Cursor of the first page not yet fully committed.
    pub cursor: Option<String>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild progress from persisted state.
    pub fn restore(
        completed: impl IntoIterator<Item = ChildRecord>,
        failed: impl IntoIterator<Item = String>,
        cursor: Option<String>,
    ) -> Self {
        let mut checkpoint = Self {
            cursor,
            ..Self::default()
        };
        for record in completed {
            checkpoint.mark_completed(record);
        }
        for id in failed {
            checkpoint.mark_failed(id);
        }
        checkpoint
    }

    pub fn mark_completed(&mut self, record: ChildRecord) {
        self.failed.retain(|id| id != &record.source_id);
        match self.positions.get(&record.source_id) {
            Some(&idx) => self.completed[idx] = record,
            None => {
                self.positions
                    .insert(record.source_id.clone(), self.completed.len());
                self.completed.push(record);
            }
        }
    }

    pub fn mark_failed(&mut self, id: impl Into<String>) {
        let id = id.into();
        if self.positions.contains_key(&id) || self.failed.contains(&id) {
            return;
        }
        self.failed.push(id);
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn is_failed(&self, id: &str) -> bool {
        self.failed.iter().any(|f| f == id)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Completed IDs in completion order.
    pub fn completed_ids(&self) -> Vec<String> {
        self.completed.iter().map(|r| r.source_id.clone()).collect()
    }

    pub fn failed_ids(&self) -> &[String] {
        &self.failed
    }

    pub fn records(&self) -> &[ChildRecord] {
        &self.completed
    }

    pub fn completed_map(&self) -> BTreeMap<String, ChildRecord> {
        self.completed
            .iter()
            .map(|r| (r.source_id.clone(), r.clone()))
            .collect()
    }
}

/// Contents of `import-experiment.json` / `import-model.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousImport {
    #[serde(
        default,
        alias = "dst_experiment_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub dst_parent_id: Option<String>,
    #[serde(
        default,
        alias = "src_experiment_id",
        alias = "src_experiement_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub src_parent_id: Option<String>,
    #[serde(
        default,
        alias = "experiment_name",
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_name: Option<String>,
    #[serde(default, alias = "runs", alias = "versions")]
    pub children: BTreeMap<String, ChildRecord>,
    #[serde(default)]
    pub failed: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PreviousImportFile {
    /// Registry imports used to record only the imported version numbers.
    /// Listed first: derived structs also accept JSON arrays.
    VersionList(Vec<serde_json::Value>),
    Full(PreviousImport),
}

impl PreviousImport {
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.failed.is_empty()
    }

    /// Completed children as a restorable checkpoint.
    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint::restore(
            self.children.values().cloned(),
            self.failed.iter().cloned(),
            None,
        )
    }
}

/// Read the previous-import file, or an empty record if absent.
pub fn read_previous_completion(path: &Path) -> Result<PreviousImport> {
    let Some(file) = atomic_read_json::<PreviousImportFile>(path)? else {
        return Ok(PreviousImport::default());
    };
    let mut previous = match file {
        PreviousImportFile::Full(previous) => previous,
        PreviousImportFile::VersionList(versions) => {
            let children = versions
                .into_iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .map(|v| (v.clone(), ChildRecord::new(v.clone(), v)))
                .collect();
            PreviousImport {
                children,
                ..PreviousImport::default()
            }
        }
    };
    for (id, record) in previous.children.iter_mut() {
        record.source_id = id.clone();
    }
    debug!(
        "Read previous import {} ({} completed)",
        path.display(),
        previous.children.len()
    );
    Ok(previous)
}

/// Merge `checkpoint` into `previous` and persist the union.
///
/// Already-committed entries are never dropped. A failed ID that has since completed
/// is removed from the failed list.
pub fn merge_and_write(
    path: &Path,
    previous: &PreviousImport,
    checkpoint: &Checkpoint,
) -> Result<PreviousImport> {
    let mut merged = previous.clone();
    for record in checkpoint.records() {
        merged
            .children
            .insert(record.source_id.clone(), record.clone());
    }
    for id in checkpoint.failed_ids() {
        if !merged.failed.contains(id) {
            merged.failed.push(id.clone());
        }
    }
    merged.failed.retain(|id| !merged.children.contains_key(id));

    atomic_write_json(path, &merged, true)?;
    debug!(
        "Checkpointed {} ({} completed, {} failed)",
        path.display(),
        merged.children.len(),
        merged.failed.len()
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_success_clears_failure() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.mark_failed("r2");
        assert!(checkpoint.is_failed("r2"));

        checkpoint.mark_completed(ChildRecord::new("r2", "d2"));
        assert!(checkpoint.is_completed("r2"));
        assert!(!checkpoint.is_failed("r2"));

        checkpoint.mark_failed("r2");
        assert!(!checkpoint.is_failed("r2"));
        assert_eq!(checkpoint.completed_count(), 1);
    }

    #[test]
    fn test_completed_keeps_order() {
        let checkpoint = Checkpoint::restore(
            vec![
                ChildRecord::new("r3", "d3"),
                ChildRecord::new("r1", "d1"),
                ChildRecord::new("r3", "d3b"),
            ],
            vec![],
            None,
        );
        assert_eq!(checkpoint.completed_ids(), vec!["r3", "r1"]);
        assert_eq!(checkpoint.completed_map()["r3"].destination_id, "d3b");
    }

    #[test]
    fn test_reads_original_experiment_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("import-experiment.json");
        std::fs::write(
            &path,
            r#"{
                "dst_experiment_id": "99",
                "src_experiement_id": "7",
                "experiment_name": "exp-A",
                "runs": {
                    "r1": {"dst_run_id": "d1", "src_parent_run_id": null, "artifact_uri": "s3://b/99/d1/artifacts"}
                }
            }"#,
        )
        .unwrap();

        let previous = read_previous_completion(&path).unwrap();
        assert_eq!(previous.dst_parent_id.as_deref(), Some("99"));
        assert_eq!(previous.src_parent_id.as_deref(), Some("7"));
        let record = &previous.children["r1"];
        assert_eq!(record.source_id, "r1");
        assert_eq!(record.destination_id, "d1");
        assert_eq!(record.artifact_uri.as_deref(), Some("s3://b/99/d1/artifacts"));
    }

    #[test]
    fn test_reads_version_list() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("import-model.json");
        std::fs::write(&path, r#"["1", "2", 3]"#).unwrap();

        let previous = read_previous_completion(&path).unwrap();
        let ids: Vec<_> = previous.children.keys().cloned().collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_merge_is_union() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("import-experiment.json");

        let mut previous = PreviousImport::default();
        previous
            .children
            .insert("r1".into(), ChildRecord::new("r1", "d1"));
        previous.failed.push("r2".into());

        let mut checkpoint = Checkpoint::new();
        checkpoint.mark_completed(ChildRecord::new("r2", "d2"));
        checkpoint.mark_failed("r3");

        let merged = merge_and_write(&path, &previous, &checkpoint).unwrap();
        assert_eq!(merged.children.len(), 2);
        assert_eq!(merged.failed, vec!["r3".to_string()]);

        let reread = read_previous_completion(&path).unwrap();
        assert_eq!(reread, merged);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let previous = read_previous_completion(&dir.path().join("none.json")).unwrap();
        assert!(previous.is_empty());
    }
}
