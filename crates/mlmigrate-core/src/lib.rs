//! mlmigrate core - resumable, concurrent migration of MLflow experiments and registered
//! models between tracking servers.
//!
//! A parent (experiment or registered model) is migrated by a [`ParentMigrator`] that
//! streams its children through a bounded [`WorkerPool`] and checkpoints after every
//! drained batch, so an interrupted run resumes where it stopped. Registered models are
//! replayed strictly in version order after gap reconciliation. [`BulkOrchestrator`] runs
//! many parents in parallel under one thread budget.
//!
//! # Example
//!
//! ```rust,ignore
//! use mlmigrate_core::{CancellationToken, MigrationConfig, ParentKind, ParentMigrator, RestStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> mlmigrate_core::Result<()> {
//!     let source = Arc::new(RestStore::new("http://mlflow-old:5000", None)?);
//!     let config = MigrationConfig::new().with_thread_budget(8);
//!     let plan = config.validate()?;
//!
//!     let mut migrator = ParentMigrator::new(config, plan.child_concurrency, CancellationToken::new());
//!     let outcome = migrator
//!         .export_parent(source, ParentKind::Experiment, "churn", "out/churn".as_ref(), None)
//!         .await?;
//!     println!("{} runs exported", outcome.report.total_completed);
//!     Ok(())
//! }
//! ```

pub mod bulk;
pub mod cancel;
pub mod config;
pub mod cursor;
pub mod error;
pub mod migrator;
pub mod pool;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod snapshot;
pub mod store;

// Re-export commonly used types
pub use bulk::{read_run_map, BulkOrchestrator, ParentFilter};
pub use cancel::CancellationToken;
pub use config::{ConcurrencyPlan, Defaults, FileNames, ImportConf, MigrationConfig};
pub use cursor::{ChildCursor, CursorPage, ParentCursor};
pub use error::{MigrateError, Result};
pub use migrator::{ChildMigrator, ParentMigrator, ParentOutcome, ParentState};
pub use pool::{TaskOutcome, WorkerPool};
pub use report::{BulkReport, ParentReport};
pub use retry::{PollPolicy, RetryPolicy};
pub use snapshot::{ChildRecord, Checkpoint};
pub use store::{MemoryStore, MetadataStore, ParentKind, RestStore};
