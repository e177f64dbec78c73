use crate::coordinator::{RunCoordinator, RunTrigger};
use crate::entities;
use crate::errors::FlowError;
use crate::registry::TableJob;
use crate::storage::{self, ExecutionLogEntry, MasterRunEntry, RunStatus};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Terminal state written to an execution log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: RunStatus,
    pub rows_copied: Option<i64>,
    pub source_row_count: Option<i64>,
    pub destination_row_count: Option<i64>,
    pub validation_mismatch: bool,
    pub watermark_value: Option<String>,
    pub error_message: Option<String>,
}

impl ExecutionOutcome {
    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            rows_copied: None,
            source_row_count: None,
            destination_row_count: None,
            validation_mismatch: false,
            watermark_value: None,
            error_message: Some(error_message.into()),
        }
    }
}

/// Record the start of a table execution
pub async fn start_table_execution(
    db: &DatabaseConnection,
    run_id: &str,
    job: &TableJob,
) -> Result<i64, FlowError> {
    use entities::execution_log;

    let now = Utc::now().timestamp();

    let execution = execution_log::ActiveModel {
        run_id: Set(run_id.to_string()),
        source_schema: Set(job.source_schema.clone()),
        source_table: Set(job.source_table.clone()),
        start_time: Set(now),
        end_time: Set(None),
        status: Set(RunStatus::Running.as_str().to_string()),
        rows_copied: Set(None),
        source_row_count: Set(None),
        destination_row_count: Set(None),
        validation_mismatch: Set(false),
        watermark_value: Set(None),
        error_message: Set(None),
        ..Default::default()
    };

    let result = execution.insert(db).await?;
    Ok(result.id)
}

/// Move a RUNNING execution to its terminal state.
///
/// Returns `false` if the entry was not RUNNING anymore; the stored state is
/// left untouched in that case.
pub async fn complete_table_execution(
    db: &DatabaseConnection,
    execution_id: i64,
    outcome: ExecutionOutcome,
) -> Result<bool, FlowError> {
    use entities::execution_log::{Column, Entity};

    if !outcome.status.is_terminal() {
        return Err(FlowError::Other(
            "execution can only be completed with a terminal status".to_string(),
        ));
    }

    let now = Utc::now().timestamp();
    let result = Entity::update_many()
        .col_expr(Column::EndTime, Expr::value(Some(now)))
        .col_expr(Column::Status, Expr::value(outcome.status.as_str()))
        .col_expr(Column::RowsCopied, Expr::value(outcome.rows_copied))
        .col_expr(Column::SourceRowCount, Expr::value(outcome.source_row_count))
        .col_expr(
            Column::DestinationRowCount,
            Expr::value(outcome.destination_row_count),
        )
        .col_expr(
            Column::ValidationMismatch,
            Expr::value(outcome.validation_mismatch),
        )
        .col_expr(Column::WatermarkValue, Expr::value(outcome.watermark_value))
        .col_expr(Column::ErrorMessage, Expr::value(outcome.error_message))
        .filter(Column::Id.eq(execution_id))
        .filter(Column::Status.eq(RunStatus::Running.as_str()))
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        warn!(execution_id, "Ignoring completion of an execution that is not running");
    }
    Ok(result.rows_affected > 0)
}

/// Record a job that was rejected before dispatch. The entry is written
/// directly in FAILED state and never occupies a worker slot.
pub async fn record_rejected_execution(
    db: &DatabaseConnection,
    run_id: &str,
    job: &TableJob,
    error_message: &str,
) -> Result<ExecutionLogEntry, FlowError> {
    use entities::execution_log;

    let now = Utc::now().timestamp();

    let execution = execution_log::ActiveModel {
        run_id: Set(run_id.to_string()),
        source_schema: Set(job.source_schema.clone()),
        source_table: Set(job.source_table.clone()),
        start_time: Set(now),
        end_time: Set(Some(now)),
        status: Set(RunStatus::Failed.as_str().to_string()),
        rows_copied: Set(None),
        source_row_count: Set(None),
        destination_row_count: Set(None),
        validation_mismatch: Set(false),
        watermark_value: Set(None),
        error_message: Set(Some(error_message.to_string())),
        ..Default::default()
    };

    let model = execution.insert(db).await?;
    ExecutionLogEntry::try_from(model)
}

/// Fail whatever RUNNING entries a run left behind for one table, used when a
/// worker dies without completing its own entry.
pub async fn fail_running_executions(
    db: &DatabaseConnection,
    run_id: &str,
    source_schema: &str,
    source_table: &str,
    error_message: &str,
) -> Result<u64, FlowError> {
    use entities::execution_log::{Column, Entity};

    let now = Utc::now().timestamp();
    let result = Entity::update_many()
        .col_expr(Column::EndTime, Expr::value(Some(now)))
        .col_expr(Column::Status, Expr::value(RunStatus::Failed.as_str()))
        .col_expr(Column::ErrorMessage, Expr::value(error_message.to_string()))
        .filter(Column::RunId.eq(run_id))
        .filter(Column::SourceSchema.eq(source_schema))
        .filter(Column::SourceTable.eq(source_table))
        .filter(Column::Status.eq(RunStatus::Running.as_str()))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}

/// Record the start of a master run
pub async fn start_master_run(
    db: &DatabaseConnection,
    run_id: &str,
    table_count: usize,
    trigger: RunTrigger,
) -> Result<(), FlowError> {
    use entities::master_execution_log;

    let run = master_execution_log::ActiveModel {
        run_id: Set(run_id.to_string()),
        start_time: Set(Utc::now().timestamp()),
        end_time: Set(None),
        status: Set(RunStatus::Running.as_str().to_string()),
        table_count: Set(table_count as i64),
        successful_tables: Set(0),
        failed_tables: Set(0),
        error_message: Set(None),
        triggered_by: Set(trigger.as_str().to_string()),
    };

    run.insert(db).await?;
    Ok(())
}

/// Record the end of a master run. Only a RUNNING run is updated.
pub async fn complete_master_run(
    db: &DatabaseConnection,
    run_id: &str,
    status: RunStatus,
    successful_tables: i64,
    failed_tables: i64,
    error_message: Option<String>,
) -> Result<MasterRunEntry, FlowError> {
    use entities::master_execution_log::{Column, Entity};

    let now = Utc::now().timestamp();
    Entity::update_many()
        .col_expr(Column::EndTime, Expr::value(Some(now)))
        .col_expr(Column::Status, Expr::value(status.as_str()))
        .col_expr(Column::SuccessfulTables, Expr::value(successful_tables))
        .col_expr(Column::FailedTables, Expr::value(failed_tables))
        .col_expr(Column::ErrorMessage, Expr::value(error_message))
        .filter(Column::RunId.eq(run_id))
        .filter(Column::Status.eq(RunStatus::Running.as_str()))
        .exec(db)
        .await?;

    storage::get_master_run(db, run_id)
        .await?
        .ok_or_else(|| FlowError::NotFound(format!("master run {}", run_id)))
}

/// Record a run that failed before any table was dispatched
pub async fn record_failed_master_run(
    db: &DatabaseConnection,
    run_id: &str,
    trigger: RunTrigger,
    error_message: &str,
) -> Result<MasterRunEntry, FlowError> {
    use entities::master_execution_log;

    let now = Utc::now().timestamp();
    let run = master_execution_log::ActiveModel {
        run_id: Set(run_id.to_string()),
        start_time: Set(now),
        end_time: Set(Some(now)),
        status: Set(RunStatus::Failed.as_str().to_string()),
        table_count: Set(0),
        successful_tables: Set(0),
        failed_tables: Set(0),
        error_message: Set(Some(error_message.to_string())),
        triggered_by: Set(trigger.as_str().to_string()),
    };

    let model = run.insert(db).await?;
    MasterRunEntry::try_from(model)
}

/// Initialize and start the scheduler that triggers runs on `schedule`.
///
/// A tick that fires while any run of `coordinator` is in flight (scheduled
/// or admin-triggered) is skipped.
pub async fn init_scheduler(
    coordinator: Arc<RunCoordinator>,
    schedule: &str,
) -> Result<JobScheduler, FlowError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| FlowError::Other(format!("Failed to create job scheduler: {}", e)))?;

    let run_job = Job::new_async(schedule, move |_uuid, _l| {
        let coordinator = coordinator.clone();
        Box::pin(async move {
            info!("Running scheduled ingestion run");
            match coordinator.try_run(RunTrigger::Schedule).await {
                None => warn!("Previous run still in progress, skipping this tick"),
                Some(Ok(run)) => info!(
                    run_id = %run.run_id,
                    status = %run.status,
                    "Scheduled run finished: {} succeeded, {} failed",
                    run.successful_tables,
                    run.failed_tables
                ),
                Some(Err(e)) => error!("Scheduled run could not be recorded: {}", e),
            }
        })
    })
    .map_err(|e| FlowError::Configuration(format!("Invalid schedule `{}`: {}", schedule, e)))?;

    sched
        .add(run_job)
        .await
        .map_err(|e| FlowError::Other(format!("Failed to add scheduled run: {}", e)))?;

    sched
        .start()
        .await
        .map_err(|e| FlowError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!(%schedule, "Job scheduler started");

    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{self, LoadType, NewTableJob};
    use sea_orm::Database;
    use sea_orm_migration::MigratorTrait;
    use tempfile::NamedTempFile;

    struct TestDb {
        connection: DatabaseConnection,
        _temp_file: NamedTempFile,
    }

    impl TestDb {
        async fn new() -> Self {
            let temp_file = NamedTempFile::new().expect("Failed to create temp file");
            let db_path = temp_file.path().to_str().expect("Invalid temp file path");
            let db_url = format!("sqlite://{}?mode=rwc", db_path);

            let connection = Database::connect(&db_url)
                .await
                .expect("Failed to connect to test database");

            migration::Migrator::up(&connection, None)
                .await
                .expect("Failed to run migrations");

            Self {
                connection,
                _temp_file: temp_file,
            }
        }

        fn connection(&self) -> &DatabaseConnection {
            &self.connection
        }
    }

    async fn seed_job(db: &DatabaseConnection) -> TableJob {
        registry::insert_table_job(
            db,
            NewTableJob {
                source_schema: "dbo".to_string(),
                source_table: "orders".to_string(),
                destination_schema: "stage".to_string(),
                destination_table: "orders".to_string(),
                load_type: LoadType::Full,
                watermark_column: None,
                last_watermark_value: None,
                is_active: true,
                priority: 1,
            },
        )
        .await
        .expect("Failed to seed job")
    }

    fn succeeded(rows: i64) -> ExecutionOutcome {
        ExecutionOutcome {
            status: RunStatus::Succeeded,
            rows_copied: Some(rows),
            source_row_count: Some(rows),
            destination_row_count: Some(rows),
            validation_mismatch: false,
            watermark_value: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_execution_lifecycle() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let job = seed_job(db).await;

        let id = start_table_execution(db, "run-1", &job)
            .await
            .expect("Failed to start execution");
        let running = storage::get_execution(db, id).await.unwrap().unwrap();
        assert_eq!(running.status, RunStatus::Running);
        assert_eq!(running.end_time, None);
        assert_eq!(storage::count_running_executions(db).await.unwrap(), 1);

        assert!(complete_table_execution(db, id, succeeded(10))
            .await
            .expect("Failed to complete execution"));

        let done = storage::get_execution(db, id).await.unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.rows_copied, Some(10));
        assert!(done.end_time.is_some());
        assert_eq!(done.error_message, None);
        assert_eq!(storage::count_running_executions(db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_terminal_state_cannot_change() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let job = seed_job(db).await;

        let id = start_table_execution(db, "run-1", &job).await.unwrap();
        assert!(complete_table_execution(db, id, ExecutionOutcome::failed("boom"))
            .await
            .unwrap());

        // A duplicate completion signal is a no-op
        let applied = complete_table_execution(db, id, succeeded(5))
            .await
            .expect("Duplicate completion must not error");
        assert!(!applied);

        let entry = storage::get_execution(db, id).await.unwrap().unwrap();
        assert_eq!(entry.status, RunStatus::Failed);
        assert_eq!(entry.error_message, Some("boom".to_string()));
        assert_eq!(entry.rows_copied, None);

        // RUNNING is not a valid completion status
        assert!(complete_table_execution(
            db,
            id,
            ExecutionOutcome {
                status: RunStatus::Running,
                ..succeeded(1)
            }
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_rejected_and_abandoned_executions() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let job = seed_job(db).await;

        let rejected = record_rejected_execution(db, "run-1", &job, "ConfigurationError: bad")
            .await
            .expect("Failed to record rejection");
        assert_eq!(rejected.status, RunStatus::Failed);
        assert!(rejected.end_time.is_some());

        start_table_execution(db, "run-1", &job).await.unwrap();
        let failed = fail_running_executions(db, "run-1", "dbo", "orders", "worker panicked")
            .await
            .unwrap();
        assert_eq!(failed, 1);

        let entries = storage::list_executions(db, "run-1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.status == RunStatus::Failed));
        assert_eq!(
            entries[0].error_message,
            Some("ConfigurationError: bad".to_string())
        );
    }

    #[tokio::test]
    async fn test_master_run_lifecycle() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        start_master_run(db, "run-1", 3, RunTrigger::Cli)
            .await
            .expect("Failed to start master run");
        let running = storage::get_master_run(db, "run-1").await.unwrap().unwrap();
        assert_eq!(running.status, RunStatus::Running);
        assert_eq!(running.table_count, 3);
        assert_eq!(running.triggered_by, "cli");

        let done = complete_master_run(db, "run-1", RunStatus::Succeeded, 2, 1, None)
            .await
            .expect("Failed to complete master run");
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.successful_tables, 2);
        assert_eq!(done.failed_tables, 1);
        assert!(done.end_time.is_some());

        // Completing again leaves the recorded result alone
        let again = complete_master_run(
            db,
            "run-1",
            RunStatus::Failed,
            0,
            0,
            Some("late".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(again, done);

        let failed = record_failed_master_run(db, "run-2", RunTrigger::Admin, "registry down")
            .await
            .unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error_message, Some("registry down".to_string()));
        assert_eq!(storage::list_master_runs(db, 10).await.unwrap().len(), 2);
    }
}
