//! Single-child copy operations.

use crate::error::{MigrateError, Result};
use crate::retry::{retry_async, RetryPolicy};
use crate::snapshot::{atomic_read_json, atomic_write_json, child_snapshot_path, ChildRecord};
use crate::store::{ChildEntity, ChildPayload, MetadataStore, ParentKind};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Prefix of the provenance tags set on imported entities.
pub const SOURCE_TAG_PREFIX: &str = "mlflow_export_import.source.";
/// Tag linking a nested run to its parent run.
pub const PARENT_RUN_TAG: &str = "mlflow.parentRunId";

/// One unit of work for a [`ChildMigrator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildTask {
    pub kind: ParentKind,
    /// Parent the child is read from (export) or created under (import).
    pub parent_id: String,
    pub child_id: String,
}

impl ChildTask {
    pub fn new(kind: ParentKind, parent_id: impl Into<String>, child_id: impl Into<String>) -> Self {
        Self {
            kind,
            parent_id: parent_id.into(),
            child_id: child_id.into(),
        }
    }
}

/// Copies one child entity. Implementations must be safe to call concurrently.
#[async_trait]
pub trait ChildMigrator: Send + Sync {
    async fn migrate(&self, task: ChildTask) -> Result<ChildRecord>;
}

/// Writes one source child to `<output_dir>/<child_id>/child.json`.
pub struct ChildExporter {
    source: Arc<dyn MetadataStore>,
    output_dir: PathBuf,
    retry: RetryPolicy,
}

impl ChildExporter {
    pub fn new(source: Arc<dyn MetadataStore>, output_dir: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            source,
            output_dir: output_dir.into(),
            retry,
        }
    }

    /// Record where the producing run of a model version lives.
    async fn enrich_version(&self, child: &mut ChildEntity) -> Result<()> {
        let Some(version) = child.as_version() else {
            return Ok(());
        };
        if version.experiment_name.is_some() && version.run_artifact_uri.is_some() {
            return Ok(());
        }
        let run_id = version.run_id.clone();
        let (located, _) = retry_async(
            &self.retry,
            || self.source.locate_run(&run_id),
            MigrateError::is_retryable,
        )
        .await;
        if let (Some(location), Some(version)) = (located?, child.as_version_mut()) {
            if version.experiment_name.is_none() {
                version.experiment_name = Some(location.experiment_name);
            }
            if version.run_artifact_uri.is_none() {
                version.run_artifact_uri = location.artifact_uri;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChildMigrator for ChildExporter {
    async fn migrate(&self, task: ChildTask) -> Result<ChildRecord> {
        let (fetched, stats) = retry_async(
            &self.retry,
            || self.source.get_child(task.kind, &task.parent_id, &task.child_id),
            MigrateError::is_retryable,
        )
        .await;
        let mut child = fetched?;
        if stats.attempts > 1 {
            debug!("Fetched {} {} after {} attempts", task.kind.child_entity(), task.child_id, stats.attempts);
        }
        self.enrich_version(&mut child).await?;

        let path = child_snapshot_path(&self.output_dir, &task.child_id);
        atomic_write_json(&path, &child, false)?;
        debug!("Exported {} {} to {}", task.kind.child_entity(), task.child_id, path.display());

        let artifact_uri = match &child.payload {
            ChildPayload::Run(run) => run.artifact_uri.clone(),
            ChildPayload::Version(_) => None,
        };
        Ok(ChildRecord::new(&task.child_id, &task.child_id).with_artifact_uri(artifact_uri))
    }
}

/// Creates one exported child under a destination parent.
pub struct ChildImporter {
    destination: Arc<dyn MetadataStore>,
    input_dir: PathBuf,
    retry: RetryPolicy,
    import_source_tags: bool,
}

impl ChildImporter {
    pub fn new(
        destination: Arc<dyn MetadataStore>,
        input_dir: impl Into<PathBuf>,
        retry: RetryPolicy,
        import_source_tags: bool,
    ) -> Self {
        Self {
            destination,
            input_dir: input_dir.into(),
            retry,
            import_source_tags,
        }
    }

    pub fn read_snapshot(&self, child_id: &str) -> Result<ChildEntity> {
        let path = child_snapshot_path(&self.input_dir, child_id);
        atomic_read_json(&path)?
            .ok_or_else(|| MigrateError::not_found("child snapshot", path.display().to_string()))
    }
}

/// Add `mlflow_export_import.source.*` tags describing where `child` came from.
pub fn add_source_tags(child: &mut ChildEntity) {
    let mut tags = vec![
        (format!("{}parent_id", SOURCE_TAG_PREFIX), child.parent_id.clone()),
    ];
    match &child.payload {
        ChildPayload::Run(run) => {
            tags.push((format!("{}run_id", SOURCE_TAG_PREFIX), child.id.clone()));
            if let Some(uri) = &run.artifact_uri {
                tags.push((format!("{}artifact_uri", SOURCE_TAG_PREFIX), uri.clone()));
            }
        }
        ChildPayload::Version(version) => {
            tags.push((format!("{}version", SOURCE_TAG_PREFIX), version.version.to_string()));
            tags.push((format!("{}run_id", SOURCE_TAG_PREFIX), version.run_id.clone()));
            tags.push((format!("{}current_stage", SOURCE_TAG_PREFIX), version.current_stage.clone()));
        }
    }
    child.tags.extend(tags);
}

#[async_trait]
impl ChildMigrator for ChildImporter {
    async fn migrate(&self, task: ChildTask) -> Result<ChildRecord> {
        let mut child = self.read_snapshot(&task.child_id)?;
        let src_parent_run_id = child.tags.remove(PARENT_RUN_TAG);
        if self.import_source_tags {
            add_source_tags(&mut child);
        }

        let (created, _) = retry_async(
            &self.retry,
            || self.destination.create_child(task.kind, &task.parent_id, &child),
            MigrateError::is_retryable,
        )
        .await;
        let created = created?;
        debug!(
            "Imported {} {} as {}",
            task.kind.child_entity(),
            task.child_id,
            created.id
        );

        Ok(ChildRecord {
            source_id: task.child_id,
            destination_id: created.id,
            artifact_uri: created.artifact_uri,
            src_parent_run_id,
        })
    }
}
