//! Bulk export index (`experiments.json` / `models.json`).

use super::atomic::{atomic_read_json, atomic_write_json};
use super::SystemInfo;
use crate::config::FileNames;
use crate::error::Result;
use crate::store::ParentKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One exported parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(alias = "experiment_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ok: usize,
    #[serde(default)]
    pub failed: usize,
}

impl IndexEntry {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ok: 0,
            failed: 0,
        }
    }
}

/// Parents contained in a bulk export directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentIndex {
    pub kind: ParentKind,
    pub parents: Vec<IndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    system: SystemInfo,
    mlflow: IndexBlock,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    experiments: Option<Vec<IndexEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    models: Option<Vec<IndexEntry>>,
}

pub fn index_path(dir: &Path, kind: ParentKind) -> PathBuf {
    match kind {
        ParentKind::Experiment => dir.join(FileNames::EXPERIMENT_INDEX),
        ParentKind::RegisteredModel => dir.join(FileNames::MODEL_INDEX),
    }
}

impl ParentIndex {
    pub fn new(kind: ParentKind, parents: Vec<IndexEntry>) -> Self {
        Self { kind, parents }
    }

    /// Read the index of `kind` from a bulk export directory.
    pub fn read(dir: &Path, kind: ParentKind) -> Result<Option<Self>> {
        let Some(file) = atomic_read_json::<IndexFile>(&index_path(dir, kind))? else {
            return Ok(None);
        };
        let parents = match kind {
            ParentKind::Experiment => file.mlflow.experiments,
            ParentKind::RegisteredModel => file.mlflow.models,
        };
        Ok(Some(Self {
            kind,
            parents: parents.unwrap_or_default(),
        }))
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let mut block = IndexBlock::default();
        match self.kind {
            ParentKind::Experiment => block.experiments = Some(self.parents.clone()),
            ParentKind::RegisteredModel => block.models = Some(self.parents.clone()),
        }
        let file = IndexFile {
            system: SystemInfo::now(self.kind),
            mlflow: block,
        };
        atomic_write_json(&index_path(dir, self.kind), &file, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_index_write_read() {
        let dir = TempDir::new().unwrap();
        let index = ParentIndex::new(
            ParentKind::Experiment,
            vec![IndexEntry::new("1", "exp-A"), IndexEntry::new("2", "exp-B")],
        );
        index.write(dir.path()).unwrap();
        assert!(dir.path().join("experiments.json").exists());

        let back = ParentIndex::read(dir.path(), ParentKind::Experiment)
            .unwrap()
            .unwrap();
        assert_eq!(back, index);
        assert!(ParentIndex::read(dir.path(), ParentKind::RegisteredModel)
            .unwrap()
            .is_none());
    }
}
