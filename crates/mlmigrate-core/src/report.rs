//! Per-parent and run-wide migration summaries.

use crate::error::Result;
use crate::snapshot::atomic_write_json;
use crate::store::ParentKind;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

/// Summary of one parent migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParentReport {
    pub kind: ParentKind,
    pub source_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<String>,
    /// Children that succeeded in this run.
    pub ok: usize,
    /// Children that failed in this run.
    pub failed: usize,
    /// Children submitted in this run (`ok + failed`).
    pub attempted: usize,
    /// Children skipped because an earlier run completed them.
    pub skipped: usize,
    /// Completed children across all runs.
    pub total_completed: usize,
    /// Children currently recorded as failed.
    pub failed_ids: Vec<String>,
    pub elapsed_secs: f64,
    /// Shutdown was requested before the input was exhausted.
    pub interrupted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ParentReport {
    pub fn new(kind: ParentKind, source_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            source_id: source_id.into(),
            name: name.into(),
            destination_id: None,
            ok: 0,
            failed: 0,
            attempted: 0,
            skipped: 0,
            total_completed: 0,
            failed_ids: Vec::new(),
            elapsed_secs: 0.0,
            interrupted: false,
            error: None,
        }
    }

    /// Report for a parent that aborted before or during its run.
    pub fn fatal(
        kind: ParentKind,
        source_id: impl Into<String>,
        name: impl Into<String>,
        error: impl ToString,
    ) -> Self {
        let mut report = Self::new(kind, source_id, name);
        report.error = Some(error.to_string());
        report
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed_secs = elapsed.as_secs_f64();
    }

    pub fn is_fatal(&self) -> bool {
        self.error.is_some()
    }

    pub fn log_summary(&self) {
        if let Some(err) = &self.error {
            error!(
                parent = %self.name,
                ok = self.ok,
                failed = self.failed,
                elapsed = format!("{:.1}s", self.elapsed_secs),
                "{} migration aborted: {}",
                self.kind,
                err
            );
        } else if self.failed > 0 || !self.failed_ids.is_empty() {
            warn!(
                parent = %self.name,
                ok = self.ok,
                failed = self.failed,
                skipped = self.skipped,
                elapsed = format!("{:.1}s", self.elapsed_secs),
                "{} migrated with failures: {:?}",
                self.kind,
                self.failed_ids
            );
        } else {
            info!(
                parent = %self.name,
                ok = self.ok,
                skipped = self.skipped,
                elapsed = format!("{:.1}s", self.elapsed_secs),
                interrupted = self.interrupted,
                "{} migrated",
                self.kind
            );
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Totals {
    pub parents: usize,
    pub parents_failed: usize,
    pub ok: usize,
    pub failed: usize,
    pub attempted: usize,
    pub skipped: usize,
}

/// Summary of a bulk run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkReport {
    pub operation: String,
    pub started_at: String,
    pub elapsed_secs: f64,
    pub interrupted: bool,
    pub totals: Totals,
    pub parents: Vec<ParentReport>,
}

impl BulkReport {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            started_at: chrono::Utc::now().to_rfc3339(),
            elapsed_secs: 0.0,
            interrupted: false,
            totals: Totals::default(),
            parents: Vec::new(),
        }
    }

    pub fn push(&mut self, report: ParentReport) {
        self.totals.parents += 1;
        if report.is_fatal() {
            self.totals.parents_failed += 1;
        }
        self.totals.ok += report.ok;
        self.totals.failed += report.failed;
        self.totals.attempted += report.attempted;
        self.totals.skipped += report.skipped;
        self.interrupted |= report.interrupted;
        self.parents.push(report);
    }

    pub fn finish(&mut self, elapsed: Duration) {
        self.elapsed_secs = elapsed.as_secs_f64();
        self.parents.sort_by(|a, b| a.name.cmp(&b.name));
    }

    pub fn write(&self, dir: &Path, file_name: &str) -> Result<()> {
        atomic_write_json(&dir.join(file_name), self, false)
    }

    pub fn log_summary(&self) {
        info!(
            parents = self.totals.parents,
            parents_failed = self.totals.parents_failed,
            ok = self.totals.ok,
            failed = self.totals.failed,
            skipped = self.totals.skipped,
            elapsed = format!("{:.1}s", self.elapsed_secs),
            "{} finished",
            self.operation
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_totals_accumulate() {
        let mut bulk = BulkReport::new("import-all");
        let mut a = ParentReport::new(ParentKind::Experiment, "1", "exp-A");
        a.ok = 2;
        a.failed = 1;
        a.attempted = 3;
        bulk.push(a);
        bulk.push(ParentReport::fatal(
            ParentKind::RegisteredModel,
            "churn",
            "churn",
            "Version mismatch",
        ));

        assert_eq!(bulk.totals.parents, 2);
        assert_eq!(bulk.totals.parents_failed, 1);
        assert_eq!(bulk.totals.ok + bulk.totals.failed, bulk.totals.attempted);
    }

    #[test]
    fn test_write_report() {
        let dir = TempDir::new().unwrap();
        let mut bulk = BulkReport::new("export-all");
        bulk.push(ParentReport::new(ParentKind::Experiment, "1", "exp-A"));
        bulk.finish(Duration::from_millis(1500));
        bulk.write(dir.path(), "export_report.json").unwrap();

        let raw: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("export_report.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["totals"]["parents"], 1);
        assert_eq!(raw["parents"][0]["kind"], "experiment");
        assert_eq!(raw["elapsed_secs"], 1.5);
    }
}
