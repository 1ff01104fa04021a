//! Centralized configuration for mlmigrate.
//!
//! File-name and default constants, the validated two-level concurrency plan, and the
//! operator override file (`import-conf.json`).

use crate::error::{MigrateError, Result};
use crate::retry::{PollPolicy, RetryPolicy};
use crate::snapshot::atomic_read_json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Names of the files making up an on-disk snapshot.
pub struct FileNames;

impl FileNames {
    pub const EXPERIMENT_MANIFEST: &'static str = "experiment.json";
    pub const MODEL_MANIFEST: &'static str = "model.json";
    pub const EXPERIMENT_CHECKPOINT: &'static str = "import-experiment.json";
    pub const MODEL_CHECKPOINT: &'static str = "import-model.json";
    pub const EXPERIMENT_INDEX: &'static str = "experiments.json";
    pub const MODEL_INDEX: &'static str = "models.json";
    pub const CHILD_SNAPSHOT: &'static str = "child.json";
    pub const IMPORT_CONF: &'static str = "import-conf.json";
    pub const EXPORT_REPORT: &'static str = "export_report.json";
    pub const IMPORT_REPORT: &'static str = "import_report.json";
}

/// Default values for tunables.
pub struct Defaults;

impl Defaults {
    pub const THREAD_BUDGET: usize = 12;
    pub const PARENT_CONCURRENCY: usize = 1;
    pub const BATCH_SIZE: usize = 50_000;
    pub const PAGE_SIZE: usize = 500;
    pub const RETRY_ATTEMPTS: u32 = 3;
    pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);
    pub const READY_POLL_ITERATIONS: u32 = 300;
    pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const DRAIN_PROGRESS_INTERVAL: Duration = Duration::from_secs(30);
}

/// Migration run configuration.
///
/// Built with `with_*` setters and checked once by [`MigrationConfig::validate`] before
/// any work is scheduled.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Total concurrent child migrations across all parents.
    pub thread_budget: usize,
    /// Number of parents migrated in parallel (outer pool).
    pub parent_concurrency: usize,
    /// Number of child tasks submitted between two checkpoints.
    pub batch_size: usize,
    /// Page size used when listing children or parents from the source.
    pub page_size: usize,
    /// Retry policy for transient store errors.
    pub retry: RetryPolicy,
    /// Polling policy while waiting for a created model version to become ready.
    pub ready_poll: PollPolicy,
    /// How often a drain barrier logs progress while waiting.
    pub drain_progress_interval: Duration,
    /// Delete an existing destination parent before the first import into it.
    pub delete_existing: bool,
    /// Carry source identity over as `mlflow_export_import.source.*` tags.
    pub import_source_tags: bool,
    /// Re-attempt children even if a checkpoint marks them completed.
    pub force: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            thread_budget: Defaults::THREAD_BUDGET,
            parent_concurrency: Defaults::PARENT_CONCURRENCY,
            batch_size: Defaults::BATCH_SIZE,
            page_size: Defaults::PAGE_SIZE,
            retry: RetryPolicy::new(Defaults::RETRY_ATTEMPTS, Defaults::RETRY_INTERVAL),
            ready_poll: PollPolicy::new(
                Defaults::READY_POLL_ITERATIONS,
                Defaults::READY_POLL_INTERVAL,
            ),
            drain_progress_interval: Defaults::DRAIN_PROGRESS_INTERVAL,
            delete_existing: false,
            import_source_tags: false,
            force: false,
        }
    }
}

impl MigrationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_budget(mut self, threads: usize) -> Self {
        self.thread_budget = threads;
        self
    }

    pub fn with_parent_concurrency(mut self, parents: usize) -> Self {
        self.parent_concurrency = parents;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_ready_poll(mut self, poll: PollPolicy) -> Self {
        self.ready_poll = poll;
        self
    }

    pub fn with_drain_progress_interval(mut self, interval: Duration) -> Self {
        self.drain_progress_interval = interval;
        self
    }

    pub fn with_delete_existing(mut self, delete: bool) -> Self {
        self.delete_existing = delete;
        self
    }

    pub fn with_import_source_tags(mut self, enabled: bool) -> Self {
        self.import_source_tags = enabled;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Validate the configuration and partition the thread budget.
    pub fn validate(&self) -> Result<ConcurrencyPlan> {
        if self.thread_budget == 0 {
            return Err(MigrateError::config("thread budget must be at least 1"));
        }
        if self.parent_concurrency == 0 {
            return Err(MigrateError::config("parent concurrency must be at least 1"));
        }
        if self.parent_concurrency > self.thread_budget {
            return Err(MigrateError::config(format!(
                "parent concurrency ({}) exceeds thread budget ({})",
                self.parent_concurrency, self.thread_budget
            )));
        }
        if self.batch_size == 0 {
            return Err(MigrateError::config("batch size must be at least 1"));
        }
        if self.page_size == 0 {
            return Err(MigrateError::config("page size must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(MigrateError::config("retry attempts must be at least 1"));
        }

        Ok(ConcurrencyPlan {
            parent_concurrency: self.parent_concurrency,
            child_concurrency: (self.thread_budget / self.parent_concurrency).max(1),
        })
    }
}

/// Two-level concurrency partition, fixed for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPlan {
    /// Outer pool size (parents in flight).
    pub parent_concurrency: usize,
    /// Inner pool size per parent (children in flight).
    pub child_concurrency: usize,
}

impl ConcurrencyPlan {
    /// Plan for running a single parent with the whole budget.
    pub fn single(threads: usize) -> Self {
        Self {
            parent_concurrency: 1,
            child_concurrency: threads.max(1),
        }
    }

    /// Upper bound of concurrent child migrations across all parents.
    pub fn ceiling(&self) -> usize {
        self.parent_concurrency * self.child_concurrency
    }
}

/// Operator overrides read from `import-conf.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConf {
    /// Users whose `/Users/<user>` experiments are imported under `/Archive/`.
    pub archived_users: Vec<String>,
    /// Per model: source run IDs that are broken at the source.
    pub missing_runs: BTreeMap<String, Vec<String>>,
    /// Experiment names whose model versions are dropped from the import.
    pub missing_experiments: Vec<String>,
}

impl ImportConf {
    /// Load `import-conf.json` from `dir`, or defaults if the file is absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(FileNames::IMPORT_CONF);
        Ok(atomic_read_json(&path)?.unwrap_or_default())
    }

    /// Rewrite `/Users/<archived user>...` experiment names to `/Archive/...`.
    pub fn archived_name(&self, name: &str) -> String {
        for user in &self.archived_users {
            if name.starts_with(&format!("/Users/{}", user)) {
                return name.replacen("/Users/", "/Archive/", 1);
            }
        }
        name.to_string()
    }

    pub fn missing_runs_for(&self, model: &str) -> &[String] {
        self.missing_runs
            .get(model)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_partitions_budget() {
        let plan = MigrationConfig::new()
            .with_thread_budget(12)
            .with_parent_concurrency(4)
            .validate()
            .unwrap();
        assert_eq!(plan.parent_concurrency, 4);
        assert_eq!(plan.child_concurrency, 3);
        assert_eq!(plan.ceiling(), 12);
    }

    #[test]
    fn test_validate_rounds_inner_pool_up_to_one() {
        let plan = MigrationConfig::new()
            .with_thread_budget(5)
            .with_parent_concurrency(5)
            .validate()
            .unwrap();
        assert_eq!(plan.child_concurrency, 1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(MigrationConfig::new().with_thread_budget(0).validate().is_err());
        assert!(MigrationConfig::new().with_batch_size(0).validate().is_err());
        assert!(MigrationConfig::new().with_page_size(0).validate().is_err());
        assert!(MigrationConfig::new()
            .with_thread_budget(2)
            .with_parent_concurrency(3)
            .validate()
            .is_err());
        let err = MigrationConfig::new()
            .with_retry(RetryPolicy::new(0, Duration::ZERO))
            .validate()
            .unwrap_err();
        assert!(matches!(err, MigrateError::Config { .. }));
    }

    #[test]
    fn test_archived_name() {
        let conf = ImportConf {
            archived_users: vec!["alice@corp.com".into()],
            ..Default::default()
        };
        assert_eq!(
            conf.archived_name("/Users/alice@corp.com/churn"),
            "/Archive/alice@corp.com/churn"
        );
        assert_eq!(conf.archived_name("/Users/bob/churn"), "/Users/bob/churn");
    }

    #[test]
    fn test_import_conf_defaults_when_absent() {
        let dir = TempDir::new().unwrap();
        let conf = ImportConf::load(dir.path()).unwrap();
        assert_eq!(conf, ImportConf::default());
        assert!(conf.missing_runs_for("any").is_empty());
    }

    #[test]
    fn test_import_conf_partial_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(FileNames::IMPORT_CONF),
            r#"{"missing_runs": {"churn": ["r9"]}}"#,
        )
        .unwrap();
        let conf = ImportConf::load(dir.path()).unwrap();
        assert_eq!(conf.missing_runs_for("churn"), ["r9".to_string()]);
        assert!(conf.archived_users.is_empty());
    }
}
