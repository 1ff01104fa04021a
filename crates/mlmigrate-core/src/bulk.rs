//! Bulk migration of many parents.
//!
//! Parents are filtered, then run through an outer pool of `parent_concurrency` slots.
//! Each parent gets its own [`ParentMigrator`] with the inner share of the thread budget.
//! A parent that fails fatally is reported and never stops its siblings.
//!
//! Directory layout of a bulk export:
//!
//! ```text
//! <dir>/experiments.json | models.json     index of exported parents
//! <dir>/<parent_id>/...                    one parent snapshot
//! <dir>/export_report.json                 run summary
//! ```

use crate::cancel::CancellationToken;
use crate::config::{ConcurrencyPlan, FileNames, ImportConf, MigrationConfig};
use crate::cursor::ParentCursor;
use crate::error::{MigrateError, Result};
use crate::migrator::{ParentMigrator, ParentOutcome};
use crate::report::{BulkReport, ParentReport};
use crate::snapshot::{
    manifest_path, previous_import_path, read_manifest, read_previous_completion, ChildRecord,
    IndexEntry, ParentIndex,
};
use crate::store::{MetadataStore, ParentKind};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Selects which parents a bulk run touches.
///
/// Applied in order: include list, exclude list, name substring. IDs in the lists match
/// either the parent ID or its name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentFilter {
    include: Option<HashSet<String>>,
    exclude: HashSet<String>,
    name_contains: Option<String>,
}

impl ParentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_include(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        let ids: HashSet<String> = ids.into_iter().collect();
        self.include = (!ids.is_empty()).then_some(ids);
        self
    }

    pub fn with_exclude(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.exclude = ids.into_iter().collect();
        self
    }

    pub fn with_name_contains(mut self, fragment: Option<String>) -> Self {
        self.name_contains = fragment.filter(|f| !f.is_empty());
        self
    }

    pub fn matches(&self, id: &str, name: &str) -> bool {
        if let Some(include) = &self.include {
            if !include.contains(id) && !include.contains(name) {
                return false;
            }
        }
        if self.exclude.contains(id) || self.exclude.contains(name) {
            return false;
        }
        match &self.name_contains {
            Some(fragment) => name.contains(fragment.as_str()),
            None => true,
        }
    }

    pub fn apply(&self, entries: Vec<IndexEntry>) -> Vec<IndexEntry> {
        let before = entries.len();
        let kept: Vec<IndexEntry> = entries
            .into_iter()
            .filter(|e| self.matches(&e.id, &e.name))
            .collect();
        if kept.len() != before {
            info!("Filtered parents: {} of {} selected", kept.len(), before);
        }
        kept
    }
}

/// Directory of one parent inside a bulk export.
pub fn parent_dir(base: &Path, id: &str) -> PathBuf {
    base.join(id.replace(['/', '\\'], "_"))
}

/// Merge the import progress of every experiment under `experiments_dir` into one map
/// from source run ID to imported run.
pub fn read_run_map(experiments_dir: &Path) -> Result<BTreeMap<String, ChildRecord>> {
    let mut runs = BTreeMap::new();
    for entry in discover(experiments_dir, ParentKind::Experiment)? {
        let path = previous_import_path(&parent_dir(experiments_dir, &entry.id), ParentKind::Experiment);
        let previous = read_previous_completion(&path)?;
        debug!("Loaded {} imported runs of {}", previous.children.len(), entry.name);
        runs.extend(previous.children);
    }
    info!("Run map holds {} imported runs", runs.len());
    Ok(runs)
}

/// Parents of `kind` in a bulk directory: the index when present, otherwise every
/// subdirectory holding a manifest.
fn discover(dir: &Path, kind: ParentKind) -> Result<Vec<IndexEntry>> {
    if let Some(index) = ParentIndex::read(dir, kind)? {
        return Ok(index.parents);
    }
    let reader = std::fs::read_dir(dir).map_err(|e| MigrateError::io_with_path(e, dir))?;
    let mut entries = Vec::new();
    for entry in reader {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let Some(manifest) = read_manifest(&manifest_path(&path, kind))? else {
            continue;
        };
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        entries.push(IndexEntry::new(id, manifest.parent.name));
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Runs whole-store exports and imports.
pub struct BulkOrchestrator {
    config: MigrationConfig,
    plan: ConcurrencyPlan,
    cancel: CancellationToken,
    filter: ParentFilter,
}

impl BulkOrchestrator {
    /// Validate `config` and fix the concurrency plan for the whole run.
    pub fn new(config: MigrationConfig, cancel: CancellationToken) -> Result<Self> {
        let plan = config.validate()?;
        info!(
            parents = plan.parent_concurrency,
            children = plan.child_concurrency,
            "Concurrency plan: {} parents x {} children",
            plan.parent_concurrency,
            plan.child_concurrency
        );
        Ok(Self {
            config,
            plan,
            cancel,
            filter: ParentFilter::default(),
        })
    }

    pub fn with_filter(mut self, filter: ParentFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn plan(&self) -> ConcurrencyPlan {
        self.plan
    }

    /// Export every selected parent of `kind` to `<output_dir>/<parent_id>/`.
    pub async fn export_all(
        &self,
        source: Arc<dyn MetadataStore>,
        kind: ParentKind,
        output_dir: &Path,
    ) -> Result<BulkReport> {
        let listed = ParentCursor::new(source.clone(), kind, self.config.page_size)
            .collect_all(&self.config.retry)
            .await?;
        let entries = self.filter.apply(
            listed
                .into_iter()
                .map(|p| IndexEntry::new(p.id, p.name))
                .collect(),
        );
        info!("Exporting {} {}s to {}", entries.len(), kind, output_dir.display());

        let base = output_dir.to_path_buf();
        let report = self
            .run_parents(&format!("export-{}s", kind), kind, entries, move |mut migrator, id| {
                let source = source.clone();
                let dir = parent_dir(&base, &id);
                async move { migrator.export_parent(source, kind, &id, &dir, None).await }
            })
            .await?;

        let exported: Vec<IndexEntry> = report
            .parents
            .iter()
            .filter(|r| !r.is_fatal())
            .map(|r| IndexEntry {
                ok: r.total_completed,
                failed: r.failed_ids.len(),
                ..IndexEntry::new(&r.source_id, &r.name)
            })
            .collect();
        ParentIndex::new(kind, exported).write(output_dir)?;
        report.write(output_dir, FileNames::EXPORT_REPORT)?;
        Ok(report)
    }

    /// Import every selected experiment found under `input_dir`.
    pub async fn import_experiments(
        &self,
        destination: Arc<dyn MetadataStore>,
        input_dir: &Path,
        conf: &ImportConf,
    ) -> Result<BulkReport> {
        let kind = ParentKind::Experiment;
        let entries = self.filter.apply(discover(input_dir, kind)?);
        info!("Importing {} experiments from {}", entries.len(), input_dir.display());

        let base = input_dir.to_path_buf();
        let conf = Arc::new(conf.clone());
        let report = self
            .run_parents("import-experiments", kind, entries, move |mut migrator, id| {
                let destination = destination.clone();
                let dir = parent_dir(&base, &id);
                let conf = conf.clone();
                async move { migrator.import_experiment(destination, &dir, None, &conf).await }
            })
            .await?;
        report.write(input_dir, FileNames::IMPORT_REPORT)?;
        Ok(report)
    }

    /// Import every selected model under `input_dir`, resolving runs through the
    /// experiments imported from `experiments_dir`.
    pub async fn import_models(
        &self,
        destination: Arc<dyn MetadataStore>,
        input_dir: &Path,
        experiments_dir: &Path,
        conf: &ImportConf,
    ) -> Result<BulkReport> {
        let kind = ParentKind::RegisteredModel;
        let run_map = Arc::new(read_run_map(experiments_dir)?);
        let entries = self.filter.apply(discover(input_dir, kind)?);
        info!("Importing {} models from {}", entries.len(), input_dir.display());

        let base = input_dir.to_path_buf();
        let conf = Arc::new(conf.clone());
        let report = self
            .run_parents("import-models", kind, entries, move |mut migrator, id| {
                let destination = destination.clone();
                let dir = parent_dir(&base, &id);
                let conf = conf.clone();
                let run_map = run_map.clone();
                async move {
                    migrator
                        .import_model(destination, &dir, None, &conf, &run_map)
                        .await
                }
            })
            .await?;
        report.write(input_dir, FileNames::IMPORT_REPORT)?;
        Ok(report)
    }

    /// Run one task per parent with at most `parent_concurrency` in flight.
    async fn run_parents<F, Fut>(
        &self,
        operation: &str,
        kind: ParentKind,
        entries: Vec<IndexEntry>,
        start: F,
    ) -> Result<BulkReport>
    where
        F: Fn(ParentMigrator, String) -> Fut,
        Fut: Future<Output = Result<ParentOutcome>> + Send + 'static,
    {
        let started = Instant::now();
        let mut report = BulkReport::new(operation);
        let slots = Arc::new(Semaphore::new(self.plan.parent_concurrency));
        let mut tasks: JoinSet<ParentReport> = JoinSet::new();

        for entry in entries {
            if self.cancel.is_cancelled() {
                warn!("Shutdown requested; not starting {}", entry.name);
                report.interrupted = true;
                break;
            }
            let permit = slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| MigrateError::Other(format!("parent pool closed: {}", e)))?;
            let migrator = ParentMigrator::new(
                self.config.clone(),
                self.plan.child_concurrency,
                self.cancel.clone(),
            );
            let parent = start(migrator, entry.id.clone());
            tasks.spawn(async move {
                let outcome = parent.await;
                drop(permit);
                match outcome {
                    Ok(outcome) => outcome.report,
                    Err(e) => {
                        let report = ParentReport::fatal(kind, entry.id, entry.name, e);
                        report.log_summary();
                        report
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(parent) => report.push(parent),
                Err(e) => warn!("Parent task aborted: {}", e),
            }
        }
        report.finish(started.elapsed());
        report.log_summary();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ParentEntity};
    use tempfile::TempDir;

    #[test]
    fn test_filter_order() {
        let filter = ParentFilter::new()
            .with_include(vec!["1".to_string(), "2".to_string(), "3".to_string()])
            .with_exclude(vec!["2".to_string()])
            .with_name_contains(Some("/Users/alice".to_string()));

        assert!(filter.matches("1", "/Users/alice/churn"));
        assert!(!filter.matches("2", "/Users/alice/fraud"));
        assert!(!filter.matches("3", "/Users/bob/churn"));
        assert!(!filter.matches("4", "/Users/alice/other"));
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        let filter = ParentFilter::new()
            .with_include(Vec::new())
            .with_name_contains(Some(String::new()));
        assert!(filter.matches("anything", "any"));
    }

    #[test]
    fn test_parent_dir_sanitizes_names() {
        let base = Path::new("/out");
        assert_eq!(parent_dir(base, "12"), PathBuf::from("/out/12"));
        assert_eq!(parent_dir(base, "team/churn"), PathBuf::from("/out/team_churn"));
    }

    #[test]
    fn test_invalid_plan_rejected() {
        let config = MigrationConfig::new()
            .with_thread_budget(2)
            .with_parent_concurrency(4);
        let err = BulkOrchestrator::new(config, CancellationToken::new()).err().unwrap();
        assert!(matches!(err, MigrateError::Config { .. }));
    }

    #[tokio::test]
    async fn test_discover_without_index_scans_directories() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new("src"));
        store.insert_parent(ParentKind::Experiment, ParentEntity::new("5", "exp-B"));
        store.insert_parent(ParentKind::Experiment, ParentEntity::new("4", "exp-A"));

        let bulk = BulkOrchestrator::new(MigrationConfig::new(), CancellationToken::new()).unwrap();
        bulk.export_all(store, ParentKind::Experiment, dir.path())
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join(FileNames::EXPERIMENT_INDEX)).unwrap();

        let found = discover(dir.path(), ParentKind::Experiment).unwrap();
        let names: Vec<&str> = found.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["exp-A", "exp-B"]);
        assert_eq!(found[0].id, "4");
    }
}
