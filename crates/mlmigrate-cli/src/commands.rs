//! Command implementations.

use crate::{Command, DestinationArgs, FilterArgs, SourceArgs, TuningArgs};
use anyhow::{Context, Result};
use mlmigrate_core::{
    read_run_map, BulkOrchestrator, CancellationToken, ConcurrencyPlan, Defaults, ImportConf,
    MemoryStore, MetadataStore, MigrationConfig, ParentFilter, ParentKind, ParentMigrator,
    ParentOutcome, RestStore, RetryPolicy,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const EXPERIMENTS_DIR: &str = "experiments";
const MODELS_DIR: &str = "models";

fn open_store(uri: &str, token: Option<String>, label: &str) -> Result<Arc<dyn MetadataStore>> {
    if uri == "memory" {
        warn!("Using an in-process {} store; nothing is persisted remotely", label);
        return Ok(Arc::new(MemoryStore::new(label)));
    }
    let store = RestStore::new(uri, token).with_context(|| format!("Invalid {} URI {}", label, uri))?;
    info!("{} store: {}", label, uri);
    Ok(Arc::new(store))
}

fn source_store(args: SourceArgs) -> Result<Arc<dyn MetadataStore>> {
    open_store(&args.source_uri, args.source_token, "source")
}

fn destination_store(args: &DestinationArgs) -> Result<Arc<dyn MetadataStore>> {
    open_store(&args.dest_uri, args.dest_token.clone(), "destination")
}

fn build_config(tuning: &TuningArgs, destination: Option<&DestinationArgs>) -> MigrationConfig {
    let mut config = MigrationConfig::new()
        .with_thread_budget(tuning.threads)
        .with_parent_concurrency(tuning.parent_threads)
        .with_batch_size(tuning.batch_size)
        .with_page_size(tuning.page_size)
        .with_retry(RetryPolicy::new(tuning.retries, Defaults::RETRY_INTERVAL))
        .with_force(tuning.force);
    if let Some(destination) = destination {
        config = config
            .with_delete_existing(destination.delete_existing)
            .with_import_source_tags(destination.import_source_tags);
    }
    config
}

fn build_filter(args: FilterArgs) -> ParentFilter {
    ParentFilter::new()
        .with_include(args.include)
        .with_exclude(args.exclude)
        .with_name_contains(args.name_contains)
}

/// Migrator for a single-parent command, using the whole thread budget.
fn single_parent(config: MigrationConfig, cancel: CancellationToken) -> Result<ParentMigrator> {
    config.validate()?;
    let plan = ConcurrencyPlan::single(config.thread_budget);
    Ok(ParentMigrator::new(config, plan.child_concurrency, cancel))
}

fn print_report(outcome: &ParentOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    Ok(())
}

fn load_conf(dir: &Path) -> Result<ImportConf> {
    ImportConf::load(dir).with_context(|| format!("Failed to read import config in {}", dir.display()))
}

pub async fn run(command: Command, cancel: CancellationToken) -> Result<()> {
    match command {
        Command::ExportExperiment {
            experiment,
            output_dir,
            run_ids,
            source,
            tuning,
        } => {
            let mut migrator = single_parent(build_config(&tuning, None), cancel)?;
            let run_ids = (!run_ids.is_empty()).then_some(run_ids);
            let outcome = migrator
                .export_parent(source_store(source)?, ParentKind::Experiment, &experiment, &output_dir, run_ids)
                .await?;
            print_report(&outcome)
        }
        Command::ImportExperiment {
            input_dir,
            experiment_name,
            destination,
            tuning,
        } => {
            let conf = load_conf(&input_dir)?;
            let store = destination_store(&destination)?;
            let mut migrator = single_parent(build_config(&tuning, Some(&destination)), cancel)?;
            let outcome = migrator
                .import_experiment(store, &input_dir, experiment_name.as_deref(), &conf)
                .await?;
            print_report(&outcome)
        }
        Command::ExportModel {
            model,
            output_dir,
            source,
            tuning,
        } => {
            let mut migrator = single_parent(build_config(&tuning, None), cancel)?;
            let outcome = migrator
                .export_parent(source_store(source)?, ParentKind::RegisteredModel, &model, &output_dir, None)
                .await?;
            print_report(&outcome)
        }
        Command::ImportModel {
            input_dir,
            model_name,
            experiments_dir,
            destination,
            tuning,
        } => {
            let conf = load_conf(&input_dir)?;
            let run_map = read_run_map(&experiments_dir)?;
            let store = destination_store(&destination)?;
            let mut migrator = single_parent(build_config(&tuning, Some(&destination)), cancel)?;
            let outcome = migrator
                .import_model(store, &input_dir, model_name.as_deref(), &conf, &run_map)
                .await?;
            print_report(&outcome)
        }
        Command::ExportAll {
            output_dir,
            experiments_only,
            source,
            filter,
            tuning,
        } => {
            let store = source_store(source)?;
            let bulk = BulkOrchestrator::new(build_config(&tuning, None), cancel.clone())?;
            let experiments = bulk
                .with_filter(build_filter(filter))
                .export_all(store.clone(), ParentKind::Experiment, &output_dir.join(EXPERIMENTS_DIR))
                .await?;
            if experiments_only || experiments.interrupted {
                return Ok(());
            }
            BulkOrchestrator::new(build_config(&tuning, None), cancel)?
                .export_all(store, ParentKind::RegisteredModel, &output_dir.join(MODELS_DIR))
                .await?;
            Ok(())
        }
        Command::ImportAll {
            input_dir,
            experiments_only,
            destination,
            filter,
            tuning,
        } => {
            let conf = load_conf(&input_dir)?;
            let store = destination_store(&destination)?;
            let config = build_config(&tuning, Some(&destination));
            let experiments_dir = input_dir.join(EXPERIMENTS_DIR);

            let experiments = BulkOrchestrator::new(config.clone(), cancel.clone())?
                .with_filter(build_filter(filter))
                .import_experiments(store.clone(), &experiments_dir, &conf)
                .await?;
            if experiments_only || experiments.interrupted {
                return Ok(());
            }
            BulkOrchestrator::new(config, cancel)?
                .import_models(store, &input_dir.join(MODELS_DIR), &experiments_dir, &conf)
                .await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> TuningArgs {
        TuningArgs {
            threads: 8,
            parent_threads: 2,
            batch_size: 100,
            page_size: 50,
            retries: 5,
            force: false,
        }
    }

    #[test]
    fn test_config_from_flags() {
        let destination = DestinationArgs {
            dest_uri: "memory".to_string(),
            dest_token: None,
            delete_existing: true,
            import_source_tags: true,
        };
        let config = build_config(&tuning(), Some(&destination));
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.delete_existing);
        assert!(config.import_source_tags);

        let plan = config.validate().unwrap();
        assert_eq!(plan.child_concurrency, 4);
    }

    #[test]
    fn test_single_parent_uses_whole_budget() {
        let migrator = single_parent(build_config(&tuning(), None), CancellationToken::new());
        assert!(migrator.is_ok());
    }

    #[test]
    fn test_memory_store_uri() {
        assert!(open_store("memory", None, "destination").is_ok());
        assert!(open_store("::not a url::", None, "source").is_err());
    }

    #[tokio::test]
    async fn test_export_all_from_empty_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let command = Command::ExportAll {
            output_dir: dir.path().to_path_buf(),
            experiments_only: false,
            source: SourceArgs {
                source_uri: "memory".to_string(),
                source_token: None,
            },
            filter: FilterArgs {
                include: Vec::new(),
                exclude: Vec::new(),
                name_contains: None,
            },
            tuning: tuning(),
        };
        run(command, CancellationToken::new()).await.unwrap();
        assert!(dir.path().join("experiments/experiments.json").exists());
        assert!(dir.path().join("models/models.json").exists());
    }
}
