//! Entities exchanged with a metadata store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of parent entity being migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentKind {
    Experiment,
    RegisteredModel,
}

impl ParentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentKind::Experiment => "experiment",
            ParentKind::RegisteredModel => "registered_model",
        }
    }

    /// Entity name of this kind's children.
    pub fn child_entity(&self) -> &'static str {
        match self {
            ParentKind::Experiment => "run",
            ParentKind::RegisteredModel => "model_version",
        }
    }

    /// Registry parents replay children strictly in sequence order.
    pub fn is_registry(&self) -> bool {
        matches!(self, ParentKind::RegisteredModel)
    }
}

impl fmt::Display for ParentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parent entity (experiment or registered model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentEntity {
    /// Source identifier. For registered models this is the model name.
    #[serde(alias = "experiment_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<i64>,
}

impl ParentEntity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tags: BTreeMap::new(),
            description: None,
            lifecycle_stage: None,
            creation_time: None,
            last_update_time: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// A child entity (run or model version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildEntity {
    /// Source identifier. For model versions this is the version number as a string.
    pub id: String,
    /// Owning parent's source identifier.
    pub parent_id: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub payload: ChildPayload,
}

impl ChildEntity {
    pub fn run(id: impl Into<String>, parent_id: impl Into<String>, data: RunData) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.into(),
            tags: BTreeMap::new(),
            payload: ChildPayload::Run(data),
        }
    }

    pub fn version(parent_id: impl Into<String>, data: VersionData) -> Self {
        Self {
            id: data.version.to_string(),
            parent_id: parent_id.into(),
            tags: BTreeMap::new(),
            payload: ChildPayload::Version(data),
        }
    }

    pub fn as_version(&self) -> Option<&VersionData> {
        match &self.payload {
            ChildPayload::Version(v) => Some(v),
            ChildPayload::Run(_) => None,
        }
    }

    pub fn as_version_mut(&mut self) -> Option<&mut VersionData> {
        match &mut self.payload {
            ChildPayload::Version(v) => Some(v),
            ChildPayload::Run(_) => None,
        }
    }
}

/// Kind-specific child content, opaque to the engine except for version numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildPayload {
    Run(RunData),
    Version(VersionData),
}

/// Run content copied between stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunData {
    pub run_name: Option<String>,
    pub status: Option<String>,
    pub user_id: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub artifact_uri: Option<String>,
    pub params: BTreeMap<String, String>,
    /// Latest value per metric key.
    pub metrics: BTreeMap<String, f64>,
}

/// Model version content copied between stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionData {
    /// Sequence number assigned by the owning registry.
    pub version: u64,
    #[serde(default = "default_stage")]
    pub current_stage: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Source run that produced the model.
    pub run_id: String,
    /// Artifact location of the model, under the run's artifact root.
    pub source: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, rename = "_run_artifact_uri")]
    pub run_artifact_uri: Option<String>,
    #[serde(default, rename = "_experiment_name")]
    pub experiment_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

fn default_stage() -> String {
    STAGE_NONE.to_string()
}

/// Registry stage meaning "no stage".
pub const STAGE_NONE: &str = "None";
/// Registry stage given to synthesized placeholder versions.
pub const STAGE_ARCHIVED: &str = "Archived";

impl VersionData {
    pub fn new(version: u64, run_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            version,
            current_stage: default_stage(),
            description: None,
            run_id: run_id.into(),
            source: source.into(),
            user_id: None,
            run_artifact_uri: None,
            experiment_name: None,
            status: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.current_stage = stage.into();
        self
    }

    pub fn with_experiment_name(mut self, name: impl Into<String>) -> Self {
        self.experiment_name = Some(name.into());
        self
    }

    /// Model path relative to the producing run's artifact root.
    pub fn model_path(&self) -> String {
        let Some(idx) = self.source.find(&self.run_id) else {
            return self.source.clone();
        };
        let rest = &self.source[idx + self.run_id.len()..];
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        rest.strip_prefix("artifacts/").unwrap_or(rest).to_string()
    }
}

/// Reference to an entity for tag and stage operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Parent { kind: ParentKind, id: String },
    Child {
        kind: ParentKind,
        parent_id: String,
        id: String,
    },
}

impl EntityRef {
    pub fn parent(kind: ParentKind, id: impl Into<String>) -> Self {
        EntityRef::Parent {
            kind,
            id: id.into(),
        }
    }

    pub fn child(kind: ParentKind, parent_id: impl Into<String>, id: impl Into<String>) -> Self {
        EntityRef::Child {
            kind,
            parent_id: parent_id.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Parent { kind, id } => write!(f, "{} {}", kind, id),
            EntityRef::Child {
                kind,
                parent_id,
                id,
            } => write!(f, "{} {}/{}", kind.child_entity(), parent_id, id),
        }
    }
}

/// Where a run lives, for enriching model versions at export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLocation {
    pub experiment_id: String,
    pub experiment_name: String,
    pub artifact_uri: Option<String>,
}

/// Result of creating a child at the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedChild {
    pub id: String,
    /// Destination-assigned sequence number (registry children only).
    pub version: Option<u64>,
    pub artifact_uri: Option<String>,
}

/// Readiness of a created child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Pending,
    Ready,
    Failed,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page; `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_path_strips_run_prefix() {
        let v = VersionData::new(1, "abc123", "dbfs:/databricks/mlflow/7/abc123/artifacts/model");
        assert_eq!(v.model_path(), "model");

        let v = VersionData::new(2, "abc123", "s3://bucket/7/abc123/sklearn-model");
        assert_eq!(v.model_path(), "sklearn-model");
    }

    #[test]
    fn test_payload_is_tagged() {
        let child = ChildEntity::version("churn", VersionData::new(3, "r1", "s3://b/r1/model"));
        let json = serde_json::to_value(&child).unwrap();
        assert_eq!(json["payload"]["type"], "version");
        assert_eq!(json["payload"]["current_stage"], "None");
        assert_eq!(child.id, "3");

        let back: ChildEntity = serde_json::from_value(json).unwrap();
        assert_eq!(back.as_version().unwrap().version, 3);
    }

    #[test]
    fn test_parent_accepts_experiment_id_key() {
        let parent: ParentEntity =
            serde_json::from_str(r#"{"experiment_id": "42", "name": "exp-A"}"#).unwrap();
        assert_eq!(parent.id, "42");
        assert!(parent.tags.is_empty());
    }
}
