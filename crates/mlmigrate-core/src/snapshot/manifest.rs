//! Parent manifests (`experiment.json`, `model.json`).
//!
//! Two on-disk layouts exist for the same data:
//! - current: `{ "system", "info", "mlflow": { "experiment" | "registered_model", "runs" | "versions" } }`
//! - legacy: `{ "export_info": { "ok_runs", "failed_runs" }, "experiment" }`
//!
//! Both are read. Only the current layout is written.

use super::atomic::{atomic_read_json, atomic_write_json};
use super::checkpoint::{ChildRecord, Checkpoint};
use super::SystemInfo;
use crate::error::{MigrateError, Result};
use crate::store::{ParentEntity, ParentKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

/// Progress block of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportInfo {
    #[serde(alias = "num_total_runs")]
    pub num_total: usize,
    #[serde(alias = "num_ok_runs")]
    pub num_ok: usize,
    #[serde(alias = "num_failed_runs")]
    pub num_failed: usize,
    #[serde(alias = "failed_runs")]
    pub failed: Vec<String>,
    /// Listing cursor of the first page not fully exported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// A parent snapshot with its export progress.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub kind: ParentKind,
    pub system: SystemInfo,
    pub info: ExportInfo,
    pub parent: ParentEntity,
    /// Successfully exported child IDs, in export order.
    pub children: Vec<String>,
}

impl Manifest {
    pub fn failed(&self) -> &[String] {
        &self.info.failed
    }

    pub fn cursor(&self) -> Option<&str> {
        self.info.cursor.as_deref()
    }

    /// Export progress as a restorable checkpoint.
    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint::restore(
            self.children.iter().map(|id| ChildRecord::new(id, id)),
            self.info.failed.iter().cloned(),
            self.info.cursor.clone(),
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CurrentLayout {
    #[serde(default)]
    system: SystemInfo,
    #[serde(default)]
    info: ExportInfo,
    mlflow: MlflowBlock,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MlflowBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    experiment: Option<ParentEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    registered_model: Option<ParentEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    runs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    versions: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct LegacyLayout {
    export_info: LegacyExportInfo,
    experiment: ParentEntity,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyExportInfo {
    ok_runs: Vec<String>,
    failed_runs: Vec<String>,
}

/// Read a manifest in either layout. Returns `None` if the file doesn't exist.
pub fn read_manifest(path: &Path) -> Result<Option<Manifest>> {
    let Some(raw) = atomic_read_json::<Value>(path)? else {
        return Ok(None);
    };

    let manifest = if raw.get("export_info").is_some() {
        let legacy: LegacyLayout = serde_json::from_value(raw)?;
        let info = ExportInfo {
            num_total: legacy.export_info.ok_runs.len() + legacy.export_info.failed_runs.len(),
            num_ok: legacy.export_info.ok_runs.len(),
            num_failed: legacy.export_info.failed_runs.len(),
            failed: legacy.export_info.failed_runs,
            cursor: None,
        };
        Manifest {
            kind: ParentKind::Experiment,
            system: SystemInfo::default(),
            info,
            parent: legacy.experiment,
            children: legacy.export_info.ok_runs,
        }
    } else if raw.get("mlflow").is_some() {
        let current: CurrentLayout = serde_json::from_value(raw)?;
        let MlflowBlock {
            experiment,
            registered_model,
            runs,
            versions,
        } = current.mlflow;
        let (kind, parent, children) = match (experiment, registered_model) {
            (Some(exp), _) => (ParentKind::Experiment, exp, runs.unwrap_or_default()),
            (None, Some(model)) => (
                ParentKind::RegisteredModel,
                model,
                versions.unwrap_or_default(),
            ),
            (None, None) => {
                return Err(MigrateError::config(format!(
                    "manifest {} has no experiment or registered_model",
                    path.display()
                )))
            }
        };
        Manifest {
            kind,
            system: current.system,
            info: current.info,
            parent,
            children,
        }
    } else {
        return Err(MigrateError::config(format!(
            "unknown manifest format: {}",
            path.display()
        )));
    };

    debug!(
        "Read manifest {} ({} ok, {} failed)",
        path.display(),
        manifest.children.len(),
        manifest.info.failed.len()
    );
    Ok(Some(manifest))
}

/// Write a manifest in the current layout.
pub fn write_manifest(
    path: &Path,
    kind: ParentKind,
    parent: &ParentEntity,
    ok_ids: &[String],
    failed_ids: &[String],
    cursor: Option<&str>,
) -> Result<()> {
    let info = ExportInfo {
        num_total: ok_ids.len() + failed_ids.len(),
        num_ok: ok_ids.len(),
        num_failed: failed_ids.len(),
        failed: failed_ids.to_vec(),
        cursor: cursor.map(str::to_string),
    };
    let mut mlflow = MlflowBlock::default();
    match kind {
        ParentKind::Experiment => {
            mlflow.experiment = Some(parent.clone());
            mlflow.runs = Some(ok_ids.to_vec());
        }
        ParentKind::RegisteredModel => {
            mlflow.registered_model = Some(parent.clone());
            mlflow.versions = Some(ok_ids.to_vec());
        }
    }
    let layout = CurrentLayout {
        system: SystemInfo::now(kind),
        info,
        mlflow,
    };
    atomic_write_json(path, &layout, false)
}
