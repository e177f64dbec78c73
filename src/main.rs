use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tableflow::connector::SqlConnector;
use tableflow::coordinator::{RunCoordinator, RunTrigger};
use tableflow::copy::CopyTask;
use tableflow::registry::{self, TableRef};
use tableflow::settings::Settings;
use tableflow::storage::{self, RunStatus};
use tableflow::{jobs, registry_sync, web};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "tableflow",
    version,
    about = "Metadata-driven table ingestion orchestrator"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or upgrade the control-plane schema
    Migrate,
    /// Register or update tables from a JSON definitions file
    Sync {
        #[arg(short, long)]
        file: String,
    },
    /// List registered tables in scheduling order
    Tables {
        /// Include inactive tables
        #[arg(long)]
        all: bool,
    },
    /// Include a table in future runs
    Activate { table: String },
    /// Exclude a table from future runs
    Deactivate { table: String },
    /// Run every active table once
    Run {
        /// Override orchestrator.concurrency_limit
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Show recent runs
    Runs {
        #[arg(short, long, default_value_t = 20)]
        limit: u64,
    },
    /// Show the table executions of one run
    Executions { run_id: String },
    /// Start the scheduler (if configured) and the admin API
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = Settings::load(&cli.config)?;
    tracing::debug!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;

    match cli.command {
        Command::Migrate => {
            tracing::info!("Schema is up to date");
        }
        Command::Sync { file } => {
            let summary = registry_sync::sync_tables_from_file(&db, &file).await?;
            println!(
                "{} created, {} updated, {} unchanged",
                summary.created, summary.updated, summary.unchanged
            );
        }
        Command::Tables { all } => {
            let jobs = if all {
                registry::list_all_jobs(&db).await?
            } else {
                registry::list_active_jobs(&db).await?
            };
            for job in jobs {
                println!(
                    "{:>5}  {:<40} -> {:<40} {:<11} {:<8} {}",
                    job.priority,
                    job.source().to_string(),
                    job.destination().to_string(),
                    job.load_type,
                    if job.is_active { "active" } else { "inactive" },
                    job.last_watermark_value.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::Activate { table } => set_active(&db, &table, true).await?,
        Command::Deactivate { table } => set_active(&db, &table, false).await?,
        Command::Run { concurrency } => {
            let coordinator = build_coordinator(&settings, db.clone()).await?;
            let limit = concurrency.unwrap_or(settings.orchestrator.concurrency_limit);
            let run = coordinator.run_all(limit, RunTrigger::Cli).await?;
            println!(
                "run {} {}: {} tables, {} succeeded, {} failed",
                run.run_id, run.status, run.table_count, run.successful_tables, run.failed_tables
            );
            if let Some(message) = run.error_message {
                println!("  error: {}", message);
            }
            if run.status == RunStatus::Failed {
                return Err(miette::miette!("run {} failed", run.run_id));
            }
        }
        Command::Runs { limit } => {
            for run in storage::list_master_runs(&db, limit).await? {
                println!(
                    "{}  {:<9} {:<8} tables={} ok={} failed={}",
                    run.run_id,
                    run.status.to_string(),
                    run.triggered_by,
                    run.table_count,
                    run.successful_tables,
                    run.failed_tables
                );
            }
        }
        Command::Executions { run_id } => {
            for entry in storage::list_executions(&db, &run_id).await? {
                println!(
                    "{:<40} {:<9} rows={} source={} destination={}{}{}",
                    format!("{}.{}", entry.source_schema, entry.source_table),
                    entry.status.to_string(),
                    entry.rows_copied.map_or("-".to_string(), |v| v.to_string()),
                    entry.source_row_count.map_or("-".to_string(), |v| v.to_string()),
                    entry
                        .destination_row_count
                        .map_or("-".to_string(), |v| v.to_string()),
                    if entry.validation_mismatch { "  MISMATCH" } else { "" },
                    entry
                        .error_message
                        .map(|m| format!("  {}", m))
                        .unwrap_or_default(),
                );
            }
        }
        Command::Serve => {
            let coordinator = Arc::new(build_coordinator(&settings, db.clone()).await?);

            // keep the scheduler alive for the lifetime of the server
            let _scheduler = match &settings.orchestrator.schedule {
                Some(schedule) => Some(jobs::init_scheduler(coordinator.clone(), schedule).await?),
                None => {
                    tracing::info!("No orchestrator.schedule configured, runs are admin-triggered only");
                    None
                }
            };

            web::serve(&settings, db, coordinator).await?;
        }
    }

    Ok(())
}

async fn build_coordinator(settings: &Settings, db: DatabaseConnection) -> Result<RunCoordinator> {
    let source = SqlConnector::connect(settings.source_url()).await?;
    let destination = SqlConnector::connect(settings.destination_url()).await?;

    let copy = CopyTask::new(db.clone(), Arc::new(source), Arc::new(destination))
        .with_batch_size(settings.copy.batch_size)
        .with_timeout(Duration::from_secs(settings.orchestrator.table_timeout_secs));

    Ok(RunCoordinator::new(db, copy).with_concurrency_limit(settings.orchestrator.concurrency_limit))
}

async fn set_active(db: &DatabaseConnection, table: &str, active: bool) -> Result<()> {
    let table = TableRef::parse(table)?;
    if !registry::set_active(db, &table.schema, &table.name, active)
        .await
        .into_diagnostic()?
    {
        return Err(miette::miette!("table {} is not registered", table));
    }
    println!(
        "{} {}",
        table,
        if active { "activated" } else { "deactivated" }
    );
    Ok(())
}
