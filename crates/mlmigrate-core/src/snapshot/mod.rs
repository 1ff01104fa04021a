//! On-disk snapshot store.
//!
//! Layout of an export directory for one parent:
//!
//! ```text
//! <dir>/experiment.json | model.json      manifest (parent + export progress)
//! <dir>/<child_id>/child.json             one child snapshot
//! <dir>/import-experiment.json | import-model.json   import progress
//! ```
//!
//! All writes are atomic (temp file + rename).

mod atomic;
mod checkpoint;
mod index;
mod manifest;

pub use atomic::{atomic_read_json, atomic_write_json};
pub use checkpoint::{
    merge_and_write, read_previous_completion, ChildRecord, Checkpoint, PreviousImport,
};
pub use index::{index_path, IndexEntry, ParentIndex};
pub use manifest::{read_manifest, write_manifest, ExportInfo, Manifest};

use crate::config::FileNames;
use crate::store::ParentKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Provenance block written at the top of every snapshot file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemInfo {
    pub package_version: String,
    pub script: String,
    /// Milliseconds since the Unix epoch.
    pub export_time: i64,
    #[serde(rename = "_export_time")]
    pub export_time_iso: String,
}

impl SystemInfo {
    pub fn now(kind: ParentKind) -> Self {
        let now = chrono::Utc::now();
        Self {
            package_version: env!("CARGO_PKG_VERSION").to_string(),
            script: format!("mlmigrate export {}", kind),
            export_time: now.timestamp_millis(),
            export_time_iso: now.to_rfc3339(),
        }
    }
}

pub fn manifest_path(dir: &Path, kind: ParentKind) -> PathBuf {
    match kind {
        ParentKind::Experiment => dir.join(FileNames::EXPERIMENT_MANIFEST),
        ParentKind::RegisteredModel => dir.join(FileNames::MODEL_MANIFEST),
    }
}

pub fn previous_import_path(dir: &Path, kind: ParentKind) -> PathBuf {
    match kind {
        ParentKind::Experiment => dir.join(FileNames::EXPERIMENT_CHECKPOINT),
        ParentKind::RegisteredModel => dir.join(FileNames::MODEL_CHECKPOINT),
    }
}

pub fn child_snapshot_path(dir: &Path, child_id: &str) -> PathBuf {
    dir.join(child_id).join(FileNames::CHILD_SNAPSHOT)
}
