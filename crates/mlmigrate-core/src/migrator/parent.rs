//! Parent migrator.
//!
//! Drives every child of one parent through a [`WorkerPool`], checkpointing after each
//! drained batch:
//!
//! ```text
//! Init -> Streaming -> Checkpointing -> (Streaming | Done)
//!   any state -> FailedFatal
//! ```
//!
//! The checkpoint is owned by the migrator; workers only return results.

use super::child::{ChildExporter, ChildImporter, ChildMigrator, ChildTask, PARENT_RUN_TAG, SOURCE_TAG_PREFIX};
use crate::cancel::CancellationToken;
use crate::config::{ImportConf, MigrationConfig};
use crate::cursor::ChildCursor;
use crate::error::{MigrateError, Result};
use crate::pool::WorkerPool;
use crate::report::ParentReport;
use crate::retry::retry_async;
use crate::snapshot::{
    manifest_path, merge_and_write, previous_import_path, read_manifest,
    read_previous_completion, write_manifest, ChildRecord, Checkpoint,
};
use crate::store::{EntityRef, MetadataStore, ParentKind};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Experiment description tag.
pub const NOTE_TAG: &str = "mlflow.note.content";
/// Tag carrying the source experiment ID on the destination.
pub const LEGACY_ID_TAG: &str = "legacy_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentState {
    Init,
    Streaming,
    Checkpointing,
    Done,
    FailedFatal,
}

/// Result of a parent migration.
#[derive(Debug, Clone)]
pub struct ParentOutcome {
    pub report: ParentReport,
    /// Every completed child, across all runs, keyed by source ID.
    pub completed: BTreeMap<String, ChildRecord>,
}

/// Where child IDs come from.
pub(crate) enum ChildInput {
    Ids(VecDeque<String>),
    Listing {
        /// Children that failed in an earlier run, retried before streaming resumes.
        retry_first: VecDeque<String>,
        cursor: ChildCursor,
        buffer: VecDeque<String>,
        page_start: Option<String>,
        page_next: Option<String>,
    },
}

impl ChildInput {
    pub(crate) fn ids(ids: impl IntoIterator<Item = String>) -> Self {
        ChildInput::Ids(ids.into_iter().collect())
    }

    pub(crate) fn listing(cursor: ChildCursor, retry_first: impl IntoIterator<Item = String>) -> Self {
        let page_start = cursor.position().map(str::to_string);
        ChildInput::Listing {
            retry_first: retry_first.into_iter().collect(),
            cursor,
            buffer: VecDeque::new(),
            page_start,
            page_next: None,
        }
    }

    fn is_listing(&self) -> bool {
        matches!(self, ChildInput::Listing { .. })
    }

    async fn next_id(&mut self, config: &MigrationConfig) -> Result<Option<String>> {
        match self {
            ChildInput::Ids(ids) => Ok(ids.pop_front()),
            ChildInput::Listing {
                retry_first,
                cursor,
                buffer,
                page_start,
                page_next,
            } => {
                if let Some(id) = retry_first.pop_front() {
                    return Ok(Some(id));
                }
                loop {
                    if let Some(id) = buffer.pop_front() {
                        return Ok(Some(id));
                    }
                    match cursor.next_page_retrying(&config.retry).await? {
                        Some(page) => {
                            *page_start = page.start;
                            *page_next = page.next;
                            buffer.extend(page.items.into_iter().map(|c| c.id));
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Cursor that is safe to persist: every child before it has been committed.
    ///
    /// Mid-page this is the current page's start. Once a page is fully submitted it is
    /// the next page's token. The last page keeps its own start, since `None` would
    /// restart the listing.
    fn resume_cursor(&self) -> Option<String> {
        match self {
            ChildInput::Ids(_) => None,
            ChildInput::Listing {
                buffer,
                page_start,
                page_next,
                ..
            } => match page_next {
                Some(next) if buffer.is_empty() => Some(next.clone()),
                _ => page_start.clone(),
            },
        }
    }
}

/// Migrates one parent at a time.
pub struct ParentMigrator {
    pub(crate) config: MigrationConfig,
    pub(crate) child_concurrency: usize,
    pub(crate) cancel: CancellationToken,
    state: ParentState,
    /// Parent name used by every state-machine log line of the current run.
    label: String,
}

impl ParentMigrator {
    pub fn new(config: MigrationConfig, child_concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            config,
            child_concurrency: child_concurrency.max(1),
            cancel,
            state: ParentState::Init,
            label: String::new(),
        }
    }

    pub fn state(&self) -> ParentState {
        self.state
    }

    /// Start a run, labelled by whatever identifies the parent before it is resolved.
    pub(crate) fn begin(&mut self, label: impl Into<String>) {
        self.state = ParentState::Init;
        self.label = label.into();
    }

    /// Switch the label to the parent's resolved name.
    pub(crate) fn relabel(&mut self, name: &str) {
        if self.label != name {
            debug!(parent = name, "Resolved {}", self.label);
            self.label = name.to_string();
        }
    }

    pub(crate) fn transition(&mut self, next: ParentState) {
        if self.state != next {
            debug!(parent = %self.label, "{:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Record a fatal outcome of `result` in the state machine.
    pub(crate) fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.transition(ParentState::Done),
            Err(e) => {
                warn!(parent = %self.label, "Parent migration failed: {}", e);
                self.transition(ParentState::FailedFatal);
            }
        }
        result
    }

    /// Resolve the destination parent by name, creating it if needed.
    ///
    /// With `delete_existing`, an existing parent is deleted first, but only when
    /// nothing was imported into it yet.
    pub(crate) async fn resolve_destination(
        &self,
        destination: &dyn MetadataStore,
        kind: ParentKind,
        name: &str,
        tags: &BTreeMap<String, String>,
        description: Option<&str>,
        fresh_import: bool,
    ) -> Result<(String, bool)> {
        if self.config.delete_existing && fresh_import {
            if let Some(existing) = destination.find_parent_by_name(kind, name).await? {
                info!(parent = name, "Deleting existing {} {}", kind, existing.id);
                destination.delete_parent(kind, &existing.id).await?;
            }
        }

        let (created, _) = retry_async(
            &self.config.retry,
            || destination.create_parent(kind, name, tags, description),
            MigrateError::is_retryable,
        )
        .await;
        match created {
            Ok(id) => {
                info!(parent = name, "Created {} {}", kind, id);
                Ok((id, true))
            }
            Err(e) if e.is_already_exists() => {
                let existing = destination
                    .find_parent_by_name(kind, name)
                    .await?
                    .ok_or_else(|| MigrateError::not_found(kind.as_str(), name))?;
                info!(parent = name, "Reusing existing {} {}", kind, existing.id);
                Ok((existing.id, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Stream children through the pool until the input is exhausted or shutdown is
    /// requested, checkpointing every `batch_size` submissions and once at the end.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn stream_children<P>(
        &mut self,
        kind: ParentKind,
        task_parent_id: &str,
        mut input: ChildInput,
        migrator: Arc<dyn ChildMigrator>,
        checkpoint: &mut Checkpoint,
        report: &mut ParentReport,
        mut persist: P,
    ) -> Result<()>
    where
        P: FnMut(&Checkpoint) -> Result<()>,
    {
        let mut pool = WorkerPool::new(
            self.label.as_str(),
            self.child_concurrency,
            self.config.drain_progress_interval,
        );
        let mut in_batch = 0;
        self.transition(ParentState::Streaming);

        loop {
            if self.cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let id = match input.next_id(&self.config).await {
                Ok(Some(id)) => id,
                Ok(None) => break,
                Err(e) => {
                    // Keep what was done before the listing broke.
                    self.checkpoint_batch(&mut pool, &input, checkpoint, report, &mut persist)
                        .await?;
                    return Err(e);
                }
            };
            if !self.config.force && checkpoint.is_completed(&id) {
                report.skipped += 1;
                continue;
            }

            let task = ChildTask::new(kind, task_parent_id, id.clone());
            let migrator = migrator.clone();
            pool.submit(id, async move { migrator.migrate(task).await })
                .await?;
            report.attempted += 1;
            in_batch += 1;

            if in_batch >= self.config.batch_size {
                self.checkpoint_batch(&mut pool, &input, checkpoint, report, &mut persist)
                    .await?;
                in_batch = 0;
            }
        }

        self.checkpoint_batch(&mut pool, &input, checkpoint, report, &mut persist)
            .await
    }

    async fn checkpoint_batch<P>(
        &mut self,
        pool: &mut WorkerPool,
        input: &ChildInput,
        checkpoint: &mut Checkpoint,
        report: &mut ParentReport,
        persist: &mut P,
    ) -> Result<()>
    where
        P: FnMut(&Checkpoint) -> Result<()>,
    {
        self.transition(ParentState::Checkpointing);
        for outcome in pool.drain().await {
            match outcome.result {
                Ok(mut record) => {
                    record.source_id = outcome.child_id;
                    report.ok += 1;
                    checkpoint.mark_completed(record);
                }
                Err(e) => {
                    warn!(parent = %self.label, child = %outcome.child_id, "Child migration failed: {}", e);
                    report.failed += 1;
                    checkpoint.mark_failed(outcome.child_id);
                }
            }
        }
        if input.is_listing() {
            checkpoint.cursor = input.resume_cursor();
        }
        persist(checkpoint)?;
        debug!(
            parent = %self.label,
            completed = checkpoint.completed_count(),
            failed = checkpoint.failed_count(),
            cursor = ?checkpoint.cursor,
            "Checkpoint written"
        );
        self.transition(ParentState::Streaming);
        Ok(())
    }

    /// Export one parent and its children to `output_dir`.
    ///
    /// Without `child_ids` the children are listed from the source, resuming at the
    /// cursor of a previous partial export. Children that failed before are retried
    /// first. Completed children are skipped unless `force` is set.
    pub async fn export_parent(
        &mut self,
        source: Arc<dyn MetadataStore>,
        kind: ParentKind,
        id_or_name: &str,
        output_dir: &Path,
        child_ids: Option<Vec<String>>,
    ) -> Result<ParentOutcome> {
        self.begin(id_or_name);
        let result = self
            .export_inner(source, kind, id_or_name, output_dir, child_ids)
            .await;
        self.settle(result)
    }

    async fn export_inner(
        &mut self,
        source: Arc<dyn MetadataStore>,
        kind: ParentKind,
        id_or_name: &str,
        output_dir: &Path,
        child_ids: Option<Vec<String>>,
    ) -> Result<ParentOutcome> {
        let started = Instant::now();
        let (parent, _) = retry_async(
            &self.config.retry,
            || source.get_parent(kind, id_or_name),
            MigrateError::is_retryable,
        )
        .await;
        let parent = parent?;
        self.relabel(&parent.name);
        let manifest_file = manifest_path(output_dir, kind);

        let mut checkpoint = match read_manifest(&manifest_file)? {
            Some(manifest) if manifest.kind != kind => {
                return Err(MigrateError::config(format!(
                    "{} holds a {}, not a {}",
                    manifest_file.display(),
                    manifest.kind,
                    kind
                )))
            }
            Some(manifest) if !self.config.force => manifest.to_checkpoint(),
            _ => Checkpoint::new(),
        };

        info!(
            parent = %parent.name,
            completed = checkpoint.completed_count(),
            failed = checkpoint.failed_count(),
            "Exporting {} {} to {}",
            kind,
            parent.id,
            output_dir.display()
        );

        let input = match child_ids {
            Some(ids) => ChildInput::ids(ids),
            None => {
                let cursor = ChildCursor::new(source.clone(), kind, &parent.id, self.config.page_size)
                    .resume_from(checkpoint.cursor.clone());
                ChildInput::listing(cursor, checkpoint.failed_ids().to_vec())
            }
        };

        let mut report = ParentReport::new(kind, &parent.id, &parent.name);
        report.destination_id = Some(output_dir.display().to_string());

        let migrator: Arc<dyn ChildMigrator> = Arc::new(ChildExporter::new(
            source.clone(),
            output_dir,
            self.config.retry,
        ));
        let persist = |cp: &Checkpoint| {
            write_manifest(
                &manifest_file,
                kind,
                &parent,
                &cp.completed_ids(),
                cp.failed_ids(),
                cp.cursor.as_deref(),
            )
        };
        self.stream_children(
            kind,
            &parent.id,
            input,
            migrator,
            &mut checkpoint,
            &mut report,
            persist,
        )
        .await?;

        report.total_completed = checkpoint.completed_count();
        report.failed_ids = checkpoint.failed_ids().to_vec();
        report.set_elapsed(started.elapsed());
        report.log_summary();
        Ok(ParentOutcome {
            report,
            completed: checkpoint.completed_map(),
        })
    }

    /// Import an exported experiment from `input_dir`.
    ///
    /// Progress is merged into `import-experiment.json` after every batch, so a rerun
    /// only attempts children that are not completed yet.
    pub async fn import_experiment(
        &mut self,
        destination: Arc<dyn MetadataStore>,
        input_dir: &Path,
        name_override: Option<&str>,
        conf: &ImportConf,
    ) -> Result<ParentOutcome> {
        self.begin(input_dir.display().to_string());
        let result = self
            .import_experiment_inner(destination, input_dir, name_override, conf)
            .await;
        self.settle(result)
    }

    async fn import_experiment_inner(
        &mut self,
        destination: Arc<dyn MetadataStore>,
        input_dir: &Path,
        name_override: Option<&str>,
        conf: &ImportConf,
    ) -> Result<ParentOutcome> {
        let started = Instant::now();
        let kind = ParentKind::Experiment;
        let manifest_file = manifest_path(input_dir, kind);
        let manifest = read_manifest(&manifest_file)?
            .ok_or_else(|| MigrateError::not_found("manifest", manifest_file.display().to_string()))?;
        let previous_file = previous_import_path(input_dir, kind);
        let mut previous = read_previous_completion(&previous_file)?;

        let src = &manifest.parent;
        let dst_name = conf.archived_name(name_override.unwrap_or(&src.name));
        self.relabel(&dst_name);
        let mut tags = src.tags.clone();
        if self.config.import_source_tags {
            tags.insert(format!("{}experiment_id", SOURCE_TAG_PREFIX), src.id.clone());
            tags.insert(format!("{}name", SOURCE_TAG_PREFIX), src.name.clone());
        }

        let (dst_id, _) = self
            .resolve_destination(&*destination, kind, &dst_name, &tags, None, previous.is_empty())
            .await?;
        self.tag_provenance(&*destination, &dst_id, src.id.as_str(), src.tags.get(NOTE_TAG))
            .await?;

        previous.dst_parent_id = Some(dst_id.clone());
        previous.src_parent_id = Some(src.id.clone());
        previous.parent_name = Some(src.name.clone());

        if !manifest.failed().is_empty() {
            warn!(
                parent = %dst_name,
                "{} runs failed at export and will not be imported: {:?}",
                manifest.failed().len(),
                manifest.failed()
            );
        }

        let mut checkpoint = previous.to_checkpoint();
        let completed_before: HashSet<String> = checkpoint.completed_ids().into_iter().collect();
        info!(
            parent = %dst_name,
            runs = manifest.children.len(),
            already_imported = completed_before.len(),
            "Importing experiment {} into {}",
            src.id,
            dst_id
        );

        let mut report = ParentReport::new(kind, &src.id, &dst_name);
        report.destination_id = Some(dst_id.clone());
        let migrator: Arc<dyn ChildMigrator> = Arc::new(ChildImporter::new(
            destination.clone(),
            input_dir,
            self.config.retry,
            self.config.import_source_tags,
        ));
        let persist = |cp: &Checkpoint| {
            previous = merge_and_write(&previous_file, &previous, cp)?;
            Ok(())
        };
        self.stream_children(
            kind,
            &dst_id,
            ChildInput::ids(manifest.children.iter().cloned()),
            migrator,
            &mut checkpoint,
            &mut report,
            persist,
        )
        .await?;

        self.link_nested_runs(&*destination, &dst_id, &checkpoint, &completed_before)
            .await;

        report.total_completed = checkpoint.completed_count();
        report.failed_ids = checkpoint.failed_ids().to_vec();
        report.set_elapsed(started.elapsed());
        report.log_summary();
        Ok(ParentOutcome {
            report,
            completed: checkpoint.completed_map(),
        })
    }

    /// Record the source experiment ID on the destination.
    async fn tag_provenance(
        &self,
        destination: &dyn MetadataStore,
        dst_id: &str,
        src_id: &str,
        note: Option<&String>,
    ) -> Result<()> {
        let entity = EntityRef::parent(ParentKind::Experiment, dst_id);
        let migrated = format!("Migrated from id: {} \n", src_id);
        let note = match note {
            Some(existing) => format!("{}{}", migrated, existing),
            None => migrated,
        };
        for (key, value) in [(NOTE_TAG, note.as_str()), (LEGACY_ID_TAG, src_id)] {
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

    /// Point `mlflow.parentRunId` of nested runs at the destination parent run.
    ///
    /// Only links touched by this run are set: either the child or its parent run was
    /// imported now.
    async fn link_nested_runs(
        &self,
        destination: &dyn MetadataStore,
        dst_experiment_id: &str,
        checkpoint: &Checkpoint,
        completed_before: &HashSet<String>,
    ) {
        let completed = checkpoint.completed_map();
        for record in checkpoint.records() {
            let Some(src_parent) = &record.src_parent_run_id else {
                continue;
            };
            let new_link = !completed_before.contains(&record.source_id)
                || !completed_before.contains(src_parent);
            let Some(parent_record) = completed.get(src_parent).filter(|_| new_link) else {
                continue;
            };
            let entity = EntityRef::child(
                ParentKind::Experiment,
                dst_experiment_id,
                &record.destination_id,
            );
            if let Err(e) = destination
                .set_tag(&entity, PARENT_RUN_TAG, &parent_record.destination_id)
                .await
            {
                warn!("Failed to link nested run {}: {}", record.destination_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChildEntity, MemoryStore, ParentEntity, RunData};
    use tempfile::TempDir;

    fn source_with_runs(ids: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new("src"));
        store.insert_parent(ParentKind::Experiment, ParentEntity::new("7", "exp-A"));
        for id in ids {
            store.insert_child(ParentKind::Experiment, ChildEntity::run(*id, "7", RunData::default()));
        }
        store
    }

    fn migrator(batch_size: usize) -> ParentMigrator {
        let config = MigrationConfig::new()
            .with_batch_size(batch_size)
            .with_page_size(2)
            .with_retry(crate::retry::RetryPolicy::none());
        ParentMigrator::new(config, 4, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_empty_parent_is_done() {
        let dir = TempDir::new().unwrap();
        let mut parent = migrator(10);
        let outcome = parent
            .export_parent(source_with_runs(&[]), ParentKind::Experiment, "7", dir.path(), None)
            .await
            .unwrap();
        assert_eq!(parent.state(), ParentState::Done);
        assert_eq!(outcome.report.attempted, 0);
        assert!(dir.path().join("experiment.json").exists());
    }

    #[tokio::test]
    async fn test_missing_parent_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut parent = migrator(10);
        let err = parent
            .export_parent(source_with_runs(&[]), ParentKind::Experiment, "nope", dir.path(), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(parent.state(), ParentState::FailedFatal);
    }

    #[tokio::test]
    async fn test_state_machine_label_follows_resolved_name() {
        let dir = TempDir::new().unwrap();
        let mut parent = migrator(10);
        parent
            .export_parent(source_with_runs(&["r1"]), ParentKind::Experiment, "7", dir.path(), None)
            .await
            .unwrap();
        assert_eq!(parent.label, "exp-A");

        let dst = Arc::new(MemoryStore::new("dst"));
        parent
            .import_experiment(dst, dir.path(), Some("exp-copy"), &ImportConf::default())
            .await
            .unwrap();
        assert_eq!(parent.label, "exp-copy");

        let missing = TempDir::new().unwrap();
        parent
            .import_experiment(Arc::new(MemoryStore::new("dst")), missing.path(), None, &ImportConf::default())
            .await
            .unwrap_err();
        assert_eq!(parent.label, missing.path().display().to_string());
        assert_eq!(parent.state(), ParentState::FailedFatal);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_interrupted() {
        let dir = TempDir::new().unwrap();
        let mut parent = migrator(10);
        parent.cancel.cancel();
        let outcome = parent
            .export_parent(source_with_runs(&["r1"]), ParentKind::Experiment, "7", dir.path(), None)
            .await
            .unwrap();
        assert!(outcome.report.interrupted);
        assert_eq!(outcome.report.attempted, 0);
    }

    #[tokio::test]
    async fn test_listing_checkpoints_next_page_cursor() {
        let dir = TempDir::new().unwrap();
        let store = source_with_runs(&["r1", "r2", "r3", "r4", "r5"]);
        store.fail_listing(Some("2"), 10);

        let mut parent = migrator(2);
        let err = parent
            .export_parent(store.clone(), ParentKind::Experiment, "7", dir.path(), None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let manifest = read_manifest(&dir.path().join("experiment.json")).unwrap().unwrap();
        let mut exported = manifest.children.clone();
        exported.sort();
        assert_eq!(exported, vec!["r1", "r2"]);
        assert_eq!(manifest.cursor(), Some("2"));
    }

    #[tokio::test]
    async fn test_explicit_ids_export() {
        let dir = TempDir::new().unwrap();
        let store = source_with_runs(&["r1", "r2", "r3"]);
        let mut parent = migrator(10);
        let outcome = parent
            .export_parent(
                store.clone(),
                ParentKind::Experiment,
                "exp-A",
                dir.path(),
                Some(vec!["r3".into(), "r1".into()]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.report.ok, 2);
        assert_eq!(store.calls().list_children, 0);
        assert!(outcome.completed.contains_key("r3"));
        assert!(!outcome.completed.contains_key("r2"));
    }
}
