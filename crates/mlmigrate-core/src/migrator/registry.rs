//! Registered model import.
//!
//! Versions are replayed one at a time in ascending order after reconciliation, since
//! the destination assigns numbers itself. Every created version is checked against its
//! expected number. Stages are applied once all versions exist.

use super::child::{add_source_tags, SOURCE_TAG_PREFIX};
use super::parent::{ParentMigrator, ParentOutcome, ParentState};
use crate::config::ImportConf;
use crate::cursor::ChildCursor;
use crate::error::{MigrateError, Result};
use crate::reconcile::{
    apply_missing_run_overrides, fill_version_gaps, remove_missing_experiments, sort_by_version,
};
use crate::report::ParentReport;
use crate::retry::{poll_until, retry_async};
use crate::snapshot::{
    atomic_read_json, child_snapshot_path, manifest_path, merge_and_write, previous_import_path,
    read_manifest, read_previous_completion, ChildRecord, Checkpoint, PreviousImport,
};
use crate::store::{ChildEntity, ChildStatus, EntityRef, MetadataStore, ParentKind, STAGE_NONE};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const KIND: ParentKind = ParentKind::RegisteredModel;

/// Load the exported version snapshots of a model. Missing snapshots are skipped and
/// later filled by gap reconciliation.
fn load_versions(input_dir: &Path, ids: &[String]) -> Result<Vec<ChildEntity>> {
    let mut versions = Vec::with_capacity(ids.len());
    for id in ids {
        match atomic_read_json::<ChildEntity>(&child_snapshot_path(input_dir, id))? {
            Some(version) => versions.push(version),
            None => warn!("Snapshot of version {} is missing in {}", id, input_dir.display()),
        }
    }
    Ok(versions)
}

/// Build the replay sequence: drop excluded experiments, fill gaps, apply manual run
/// overrides, sort ascending.
fn reconcile(
    input_dir: &Path,
    ids: &[String],
    model: &str,
    conf: &ImportConf,
) -> Result<Vec<ChildEntity>> {
    let mut versions = load_versions(input_dir, ids)?;
    let removed = remove_missing_experiments(&mut versions, &conf.missing_experiments);
    if removed > 0 {
        info!(parent = model, "Removed {} versions of missing experiments", removed);
    }
    let placeholders = fill_version_gaps(&versions);
    versions.extend(placeholders);
    apply_missing_run_overrides(&mut versions, conf.missing_runs_for(model))?;
    sort_by_version(&mut versions);
    Ok(versions)
}

async fn is_ready(destination: &dyn MetadataStore, entity: &EntityRef) -> Result<bool> {
    match destination.child_status(entity).await? {
        ChildStatus::Ready => Ok(true),
        ChildStatus::Pending => Ok(false),
        ChildStatus::Failed => Err(MigrateError::Store {
            message: format!("{} failed registration", entity),
            error_code: Some("FAILED_REGISTRATION".to_string()),
        }),
    }
}

impl ParentMigrator {
    /// Import an exported registered model from `input_dir`.
    ///
    /// `run_map` maps source run IDs to the runs created by experiment imports. Every
    /// version must resolve its run through it.
    pub async fn import_model(
        &mut self,
        destination: Arc<dyn MetadataStore>,
        input_dir: &Path,
        name_override: Option<&str>,
        conf: &ImportConf,
        run_map: &BTreeMap<String, ChildRecord>,
    ) -> Result<ParentOutcome> {
        self.begin(input_dir.display().to_string());
        let result = self
            .import_model_inner(destination, input_dir, name_override, conf, run_map)
            .await;
        self.settle(result)
    }

    async fn import_model_inner(
        &mut self,
        destination: Arc<dyn MetadataStore>,
        input_dir: &Path,
        name_override: Option<&str>,
        conf: &ImportConf,
        run_map: &BTreeMap<String, ChildRecord>,
    ) -> Result<ParentOutcome> {
        let started = Instant::now();
        let manifest_file = manifest_path(input_dir, KIND);
        let manifest = read_manifest(&manifest_file)?
            .ok_or_else(|| MigrateError::not_found("manifest", manifest_file.display().to_string()))?;
        let previous_file = previous_import_path(input_dir, KIND);
        let mut previous = read_previous_completion(&previous_file)?;

        let src = &manifest.parent;
        let dst_name = name_override.unwrap_or(&src.name).to_string();
        self.relabel(&dst_name);
        let mut tags = src.tags.clone();
        if self.config.import_source_tags {
            tags.insert(format!("{}name", SOURCE_TAG_PREFIX), src.name.clone());
        }

        let (dst_id, created) = self
            .resolve_destination(
                &*destination,
                KIND,
                &dst_name,
                &tags,
                src.description.as_deref(),
                previous.is_empty(),
            )
            .await?;
        if !created {
            self.apply_parent_tags(&*destination, &dst_id, &tags).await?;
        }
        previous.dst_parent_id = Some(dst_id.clone());
        previous.src_parent_id = Some(src.id.clone());
        previous.parent_name = Some(src.name.clone());

        if !manifest.failed().is_empty() {
            warn!(
                parent = %dst_name,
                "{} versions failed at export: {:?}",
                manifest.failed().len(),
                manifest.failed()
            );
        }

        let versions = reconcile(input_dir, &manifest.children, &src.name, conf)?;
        let mut checkpoint = previous.to_checkpoint();
        if !created {
            self.adopt_existing_versions(destination.clone(), &dst_id, &versions, &mut checkpoint)
                .await?;
            self.checkpoint_versions(&previous_file, &mut previous, &checkpoint)?;
        }
        let mut report = ParentReport::new(KIND, &src.id, &dst_name);
        report.destination_id = Some(dst_id.clone());
        info!(
            parent = %dst_name,
            versions = versions.len(),
            already_imported = checkpoint.completed_count(),
            "Importing registered model"
        );

        // Every created version is checkpointed at once: the destination has already
        // consumed its number.
        self.transition(ParentState::Streaming);
        for version in &versions {
            if self.cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            if checkpoint.is_completed(&version.id) {
                report.skipped += 1;
                continue;
            }

            report.attempted += 1;
            let created = self
                .create_version(&*destination, &dst_id, version, run_map)
                .await;
            match created {
                Ok(record) => {
                    report.ok += 1;
                    checkpoint.mark_completed(record);
                    self.checkpoint_versions(&previous_file, &mut previous, &checkpoint)?;
                }
                Err(e) => {
                    checkpoint.mark_failed(version.id.clone());
                    self.checkpoint_versions(&previous_file, &mut previous, &checkpoint)?;
                    return Err(e);
                }
            }
        }
        self.checkpoint_versions(&previous_file, &mut previous, &checkpoint)?;

        if !report.interrupted {
            self.apply_stages(&*destination, &dst_id, &versions, &checkpoint)
                .await?;
        }

        report.total_completed = checkpoint.completed_count();
        report.failed_ids = checkpoint.failed_ids().to_vec();
        report.set_elapsed(started.elapsed());
        report.log_summary();
        Ok(ParentOutcome {
            report,
            completed: checkpoint.completed_map(),
        })
    }

    fn checkpoint_versions(
        &mut self,
        path: &Path,
        previous: &mut PreviousImport,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        self.transition(ParentState::Checkpointing);
        *previous = merge_and_write(path, previous, checkpoint)?;
        self.transition(ParentState::Streaming);
        Ok(())
    }

    /// Mark versions the destination model already holds as completed.
    ///
    /// A version created right before a crash exists on the destination without a
    /// checkpoint entry. Creating it again would shift every later number.
    async fn adopt_existing_versions(
        &self,
        destination: Arc<dyn MetadataStore>,
        dst_model: &str,
        versions: &[ChildEntity],
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        let mut cursor = ChildCursor::new(destination, KIND, dst_model, self.config.page_size);
        let mut existing: BTreeMap<u64, String> = BTreeMap::new();
        while let Some(page) = cursor.next_page_retrying(&self.config.retry).await? {
            for child in page.items {
                if let Some(data) = child.as_version() {
                    existing.insert(data.version, child.id.clone());
                }
            }
        }

        let mut adopted = Vec::new();
        for version in versions {
            let Some(data) = version.as_version() else {
                continue;
            };
            if checkpoint.is_completed(&version.id) {
                continue;
            }
            if let Some(dst_version) = existing.get(&data.version) {
                checkpoint.mark_completed(ChildRecord::new(&version.id, dst_version));
                adopted.push(data.version);
            }
        }
        if !adopted.is_empty() {
            warn!(
                parent = dst_model,
                "Versions {:?} already exist on the destination without a checkpoint entry",
                adopted
            );
        }
        Ok(())
    }

    async fn apply_parent_tags(
        &self,
        destination: &dyn MetadataStore,
        dst_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let entity = EntityRef::parent(KIND, dst_id);
        for (key, value) in tags {
            let (result, _) = retry_async(
                &self.config.retry,
                || destination.set_tag(&entity, key, value),
                MigrateError::is_retryable,
            )
            .await;
            result?;
        }
        Ok(())
    }

    /// Create one version and verify the number the destination assigned.
    async fn create_version(
        &self,
        destination: &dyn MetadataStore,
        dst_model: &str,
        version: &ChildEntity,
        run_map: &BTreeMap<String, ChildRecord>,
    ) -> Result<ChildRecord> {
        let child_failed = |reason: String| MigrateError::ChildFailed {
            parent: dst_model.to_string(),
            child: version.id.clone(),
            reason,
        };
        let data = version
            .as_version()
            .ok_or_else(|| child_failed("not a model version".to_string()))?;
        let expected = data.version;
        let run = run_map
            .get(&data.run_id)
            .ok_or_else(|| child_failed(format!("run {} was not imported", data.run_id)))?;

        let mut payload = version.clone();
        if self.config.import_source_tags {
            add_source_tags(&mut payload);
        }
        if let Some(target) = payload.as_version_mut() {
            target.run_id = run.destination_id.clone();
            if let Some(uri) = &run.artifact_uri {
                target.source = format!("{}/{}", uri.trim_end_matches('/'), data.model_path());
            }
        }

        let (created, _) = retry_async(
            &self.config.retry,
            || destination.create_child(KIND, dst_model, &payload),
            MigrateError::is_retryable,
        )
        .await;
        let created = created.map_err(|e| child_failed(e.to_string()))?;
        let actual = created
            .version
            .or_else(|| created.id.parse().ok())
            .unwrap_or_default();
        if actual != expected {
            return Err(MigrateError::SequenceMismatch {
                parent: dst_model.to_string(),
                expected,
                actual,
            });
        }
        debug!(parent = dst_model, "Created version {} from run {}", actual, run.destination_id);

        self.wait_until_ready(destination, dst_model, &created.id)
            .await?;
        Ok(ChildRecord::new(&version.id, &created.id))
    }

    /// Poll a created version until it is ready. A timeout only warns.
    async fn wait_until_ready(
        &self,
        destination: &dyn MetadataStore,
        dst_model: &str,
        version_id: &str,
    ) -> Result<()> {
        let entity = EntityRef::child(KIND, dst_model, version_id);
        let entity = &entity;
        let ready = poll_until(&self.config.ready_poll, move || {
            is_ready(destination, entity)
        })
        .await?;
        if !ready {
            warn!(
                parent = dst_model,
                "Version {} not ready after {} polls",
                version_id,
                self.config.ready_poll.iterations
            );
        }
        Ok(())
    }

    /// Transition every imported version with a stage other than `None`, in ascending
    /// order. Previously imported versions are included.
    async fn apply_stages(
        &self,
        destination: &dyn MetadataStore,
        dst_model: &str,
        versions: &[ChildEntity],
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        let completed = checkpoint.completed_map();
        for version in versions {
            let Some(data) = version.as_version() else {
                continue;
            };
            if data.current_stage == STAGE_NONE {
                continue;
            }
            let Some(record) = completed.get(&version.id) else {
                continue;
            };
            self.wait_until_ready(destination, dst_model, &record.destination_id)
                .await?;

            let entity = EntityRef::child(KIND, dst_model, &record.destination_id);
            let (result, _) = retry_async(
                &self.config.retry,
                || destination.transition_state(&entity, &data.current_stage),
                MigrateError::is_retryable,
            )
            .await;
            result?;
            debug!(parent = dst_model, "Version {} moved to {}", record.destination_id, data.current_stage);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::config::MigrationConfig;
    use crate::retry::{PollPolicy, RetryPolicy};
    use crate::snapshot::{atomic_write_json, write_manifest};
    use crate::store::{MemoryStore, ParentEntity, VersionData, STAGE_ARCHIVED};
    use std::time::Duration;
    use tempfile::TempDir;

    fn export_model(dir: &Path, numbers: &[u64]) {
        let parent = ParentEntity::new("churn", "churn");
        let ids: Vec<String> = numbers.iter().map(u64::to_string).collect();
        for n in numbers {
            let data = VersionData::new(*n, format!("run-{}", n), format!("s3://src/1/run-{}/artifacts/model", n))
                .with_stage(if *n == 2 { "Production" } else { STAGE_NONE });
            let version = ChildEntity::version("churn", data);
            atomic_write_json(&child_snapshot_path(dir, &n.to_string()), &version, false).unwrap();
        }
        write_manifest(&manifest_path(dir, KIND), KIND, &parent, &ids, &[], None).unwrap();
    }

    fn run_map(numbers: &[u64]) -> BTreeMap<String, ChildRecord> {
        numbers
            .iter()
            .map(|n| {
                let src = format!("run-{}", n);
                let record = ChildRecord::new(&src, format!("dst-{}", n))
                    .with_artifact_uri(Some(format!("memory://dst/9/dst-{}/artifacts", n)));
                (src, record)
            })
            .collect()
    }

    fn migrator() -> ParentMigrator {
        let config = MigrationConfig::new()
            .with_retry(RetryPolicy::none())
            .with_ready_poll(PollPolicy::new(3, Duration::from_millis(1)));
        ParentMigrator::new(config, 1, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_gaps_are_replayed_in_order() {
        let dir = TempDir::new().unwrap();
        export_model(dir.path(), &[1, 2, 4, 6]);
        let dst = Arc::new(MemoryStore::new("dst"));

        let outcome = migrator()
            .import_model(dst.clone(), dir.path(), None, &ImportConf::default(), &run_map(&[1, 2, 4, 6]))
            .await
            .unwrap();

        assert_eq!(dst.calls().created_versions, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(outcome.report.ok, 6);
        let created = dst.children(KIND, "churn");
        let three = created.iter().find(|c| c.id == "3").unwrap().as_version().unwrap();
        assert_eq!(three.run_id, "dst-2");
        assert_eq!(three.current_stage, STAGE_ARCHIVED);
        assert_eq!(three.source, "memory://dst/9/dst-2/artifacts/model");
        let two = created.iter().find(|c| c.id == "2").unwrap().as_version().unwrap();
        assert_eq!(two.current_stage, "Production");
    }

    #[tokio::test]
    async fn test_unmapped_run_is_fatal() {
        let dir = TempDir::new().unwrap();
        export_model(dir.path(), &[1, 2]);
        let dst = Arc::new(MemoryStore::new("dst"));

        let mut parent = migrator();
        let err = parent
            .import_model(dst.clone(), dir.path(), None, &ImportConf::default(), &run_map(&[1]))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::ChildFailed { .. }));
        assert_eq!(parent.state(), ParentState::FailedFatal);

        let previous = read_previous_completion(&previous_import_path(dir.path(), KIND)).unwrap();
        assert!(previous.children.contains_key("1"));
        assert_eq!(previous.failed, vec!["2"]);
    }

    #[tokio::test]
    async fn test_failed_import_resumes_at_failed_version() {
        let dir = TempDir::new().unwrap();
        export_model(dir.path(), &[1, 2, 3, 4]);
        let dst = Arc::new(MemoryStore::new("dst"));

        migrator()
            .import_model(dst.clone(), dir.path(), None, &ImportConf::default(), &run_map(&[1, 2]))
            .await
            .unwrap_err();
        assert_eq!(dst.calls().created_versions, vec![1, 2]);

        let outcome = migrator()
            .import_model(dst.clone(), dir.path(), None, &ImportConf::default(), &run_map(&[1, 2, 3, 4]))
            .await
            .unwrap();
        assert_eq!(outcome.report.skipped, 2);
        assert_eq!(outcome.report.attempted, 2);
        assert_eq!(outcome.report.ok, 2);
        assert!(outcome.report.failed_ids.is_empty());
        assert_eq!(dst.calls().created_versions, vec![1, 2, 3, 4]);
        for n in ["1", "2", "3", "4"] {
            assert_eq!(outcome.completed[n].destination_id, n);
        }
    }

    #[tokio::test]
    async fn test_lost_checkpoint_does_not_recreate_versions() {
        let dir = TempDir::new().unwrap();
        export_model(dir.path(), &[1, 2, 3]);
        let dst = Arc::new(MemoryStore::new("dst"));
        let runs = run_map(&[1, 2, 3]);

        migrator()
            .import_model(dst.clone(), dir.path(), None, &ImportConf::default(), &runs)
            .await
            .unwrap();
        std::fs::remove_file(previous_import_path(dir.path(), KIND)).unwrap();

        let outcome = migrator()
            .import_model(dst.clone(), dir.path(), None, &ImportConf::default(), &runs)
            .await
            .unwrap();
        assert_eq!(outcome.report.attempted, 0);
        assert_eq!(outcome.report.total_completed, 3);
        assert_eq!(dst.calls().created_versions, vec![1, 2, 3]);

        let previous = read_previous_completion(&previous_import_path(dir.path(), KIND)).unwrap();
        assert_eq!(previous.children.len(), 3);
    }

    #[tokio::test]
    async fn test_version_created_before_checkpoint_is_adopted() {
        let dir = TempDir::new().unwrap();
        export_model(dir.path(), &[1, 2, 3, 4]);
        let dst = Arc::new(MemoryStore::new("dst"));

        // Versions 1..3 are created, then the process dies before 3 is checkpointed.
        migrator()
            .import_model(dst.clone(), dir.path(), None, &ImportConf::default(), &run_map(&[1, 2, 3]))
            .await
            .unwrap_err();
        let path = previous_import_path(dir.path(), KIND);
        let mut previous = read_previous_completion(&path).unwrap();
        previous.children.remove("3");
        previous.failed.clear();
        atomic_write_json(&path, &previous, false).unwrap();

        let outcome = migrator()
            .import_model(dst.clone(), dir.path(), None, &ImportConf::default(), &run_map(&[1, 2, 3, 4]))
            .await
            .unwrap();
        assert_eq!(outcome.report.attempted, 1);
        assert_eq!(dst.calls().created_versions, vec![1, 2, 3, 4]);
        assert_eq!(outcome.completed["3"].destination_id, "3");
    }

    #[tokio::test]
    async fn test_missing_experiment_versions_become_placeholders() {
        let dir = TempDir::new().unwrap();
        export_model(dir.path(), &[1, 2]);
        let mut gone: ChildEntity = atomic_read_json(&child_snapshot_path(dir.path(), "1")).unwrap().unwrap();
        if let Some(data) = gone.as_version_mut() {
            data.experiment_name = Some("/Users/gone".into());
        }
        atomic_write_json(&child_snapshot_path(dir.path(), "1"), &gone, false).unwrap();

        let conf = ImportConf {
            missing_experiments: vec!["/Users/gone".into()],
            ..ImportConf::default()
        };
        let dst = Arc::new(MemoryStore::new("dst"));
        migrator()
            .import_model(dst.clone(), dir.path(), None, &conf, &run_map(&[2]))
            .await
            .unwrap();

        let created = dst.children(KIND, "churn");
        let one = created.iter().find(|c| c.id == "1").unwrap().as_version().unwrap();
        assert_eq!(one.run_id, "dst-2");
        assert_eq!(one.current_stage, STAGE_ARCHIVED);
    }
}
