use async_graphql::*;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::coordinator::{RunCoordinator, RunTrigger};
use crate::registry::{self, TableJob};
use crate::storage::{self, ExecutionLogEntry, MasterRunEntry};

fn db<'a>(ctx: &'a Context<'_>) -> Result<&'a Arc<DatabaseConnection>> {
    ctx.data::<Arc<DatabaseConnection>>()
        .map_err(|_| Error::new("Database connection not available"))
}

/// Custom mutations for admin operations
#[derive(Default)]
pub struct AdminMutation;

#[Object]
impl AdminMutation {
    /// Start a full ingestion run.
    ///
    /// By default the run continues in the background and only its id is
    /// returned; poll `run(runId)` for progress. A run requested while another
    /// is in progress starts once that one has finished.
    async fn trigger_run(
        &self,
        ctx: &Context<'_>,
        #[graphql(desc = "Override the configured concurrency limit")] concurrency_limit: Option<
            i32,
        >,
        #[graphql(desc = "Wait for the run to finish and return its summary", default = false)]
        wait: bool,
    ) -> Result<RunTriggerResult> {
        let coordinator = ctx
            .data::<Arc<RunCoordinator>>()
            .map_err(|_| Error::new("Run coordinator not available"))?
            .clone();

        let limit = concurrency_limit
            .map(|l| l.max(1) as usize)
            .unwrap_or_else(|| coordinator.concurrency_limit());
        let run_id = RunCoordinator::new_run_id();
        let queued = coordinator.is_running();

        if wait {
            let run = coordinator
                .run_with_id(&run_id, limit, RunTrigger::Admin)
                .await
                .map_err(|e| Error::new(format!("Run could not be recorded: {}", e)))?;
            return Ok(RunTriggerResult {
                run_id,
                queued,
                run: Some(RunSummary::from(run)),
            });
        }

        let background_id = run_id.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator
                .run_with_id(&background_id, limit, RunTrigger::Admin)
                .await
            {
                tracing::error!(run_id = %background_id, "Admin run could not be recorded: {}", e);
            }
        });

        Ok(RunTriggerResult {
            run_id,
            queued,
            run: None,
        })
    }

    /// Activate or deactivate a registered table
    async fn set_table_active(
        &self,
        ctx: &Context<'_>,
        source_schema: String,
        source_table: String,
        active: bool,
    ) -> Result<TableActivationResult> {
        let db = db(ctx)?;

        match registry::set_active(db.as_ref(), &source_schema, &source_table, active).await {
            Ok(true) => Ok(TableActivationResult {
                success: true,
                message: format!(
                    "Table '{}.{}' {}",
                    source_schema,
                    source_table,
                    if active { "activated" } else { "deactivated" }
                ),
            }),
            Ok(false) => Ok(TableActivationResult {
                success: false,
                message: format!("Table '{}.{}' is not registered", source_schema, source_table),
            }),
            Err(e) => Ok(TableActivationResult {
                success: false,
                message: format!("Failed to update '{}.{}': {}", source_schema, source_table, e),
            }),
        }
    }
}

#[derive(SimpleObject)]
pub struct RunTriggerResult {
    pub run_id: String,
    /// Another run was in progress; this one starts after it
    pub queued: bool,
    /// Present when the trigger waited for the run
    pub run: Option<RunSummary>,
}

#[derive(SimpleObject)]
pub struct TableActivationResult {
    pub success: bool,
    pub message: String,
}

/// Custom queries for admin operations
#[derive(Default)]
pub struct AdminQuery;

#[Object]
impl AdminQuery {
    /// Registered tables in scheduling order
    async fn tables(
        &self,
        ctx: &Context<'_>,
        #[graphql(desc = "Only list active tables", default = false)] active_only: bool,
    ) -> Result<Vec<TableInfo>> {
        let db = db(ctx)?;

        let jobs = if active_only {
            registry::list_active_jobs(db.as_ref()).await
        } else {
            registry::list_all_jobs(db.as_ref()).await
        }
        .map_err(|e| Error::new(format!("Database error: {}", e)))?;

        Ok(jobs.into_iter().map(TableInfo::from).collect())
    }

    /// Most recent runs first
    async fn runs(
        &self,
        ctx: &Context<'_>,
        #[graphql(desc = "Limit number of results", default = 20)] limit: i64,
    ) -> Result<Vec<RunSummary>> {
        let db = db(ctx)?;

        let runs = storage::list_master_runs(db.as_ref(), limit.max(0) as u64)
            .await
            .map_err(|e| Error::new(format!("Database error: {}", e)))?;

        Ok(runs.into_iter().map(RunSummary::from).collect())
    }

    async fn run(&self, ctx: &Context<'_>, run_id: String) -> Result<Option<RunSummary>> {
        let db = db(ctx)?;

        let run = storage::get_master_run(db.as_ref(), &run_id)
            .await
            .map_err(|e| Error::new(format!("Database error: {}", e)))?;

        Ok(run.map(RunSummary::from))
    }

    /// Table executions of one run
    async fn executions(
        &self,
        ctx: &Context<'_>,
        run_id: String,
        #[graphql(desc = "Only show failed tables", default = false)] only_failures: bool,
        #[graphql(desc = "Limit number of results", default = 100)] limit: i64,
    ) -> Result<Vec<ExecutionLog>> {
        let db = db(ctx)?;

        let entries =
            storage::list_run_executions(db.as_ref(), &run_id, only_failures, limit.max(0) as u64)
                .await
                .map_err(|e| Error::new(format!("Database error: {}", e)))?;

        Ok(entries.into_iter().map(ExecutionLog::from).collect())
    }
}

/// Table registry entry
#[derive(SimpleObject)]
pub struct TableInfo {
    pub source_schema: String,
    pub source_table: String,
    pub destination_schema: String,
    pub destination_table: String,
    pub load_type: String,
    pub watermark_column: Option<String>,
    pub last_watermark_value: Option<String>,
    pub is_active: bool,
    pub priority: i32,
    pub modified_date: i64,
}

impl From<TableJob> for TableInfo {
    fn from(job: TableJob) -> Self {
        Self {
            source_schema: job.source_schema,
            source_table: job.source_table,
            destination_schema: job.destination_schema,
            destination_table: job.destination_table,
            load_type: job.load_type,
            watermark_column: job.watermark_column,
            last_watermark_value: job.last_watermark_value,
            is_active: job.is_active,
            priority: job.priority,
            modified_date: job.modified_date,
        }
    }
}

/// Master run entry
#[derive(SimpleObject)]
pub struct RunSummary {
    pub run_id: String,
    pub status: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub table_count: i64,
    pub successful_tables: i64,
    pub failed_tables: i64,
    pub error_message: Option<String>,
    pub triggered_by: String,
}

impl From<MasterRunEntry> for RunSummary {
    fn from(run: MasterRunEntry) -> Self {
        Self {
            run_id: run.run_id,
            status: run.status.to_string(),
            start_time: run.start_time,
            end_time: run.end_time,
            table_count: run.table_count,
            successful_tables: run.successful_tables,
            failed_tables: run.failed_tables,
            error_message: run.error_message,
            triggered_by: run.triggered_by,
        }
    }
}

/// Execution log entry
#[derive(SimpleObject)]
pub struct ExecutionLog {
    pub id: i64,
    pub source_schema: String,
    pub source_table: String,
    pub status: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub rows_copied: Option<i64>,
    pub source_row_count: Option<i64>,
    pub destination_row_count: Option<i64>,
    pub validation_mismatch: bool,
    pub watermark_value: Option<String>,
    pub error_message: Option<String>,
}

impl From<ExecutionLogEntry> for ExecutionLog {
    fn from(entry: ExecutionLogEntry) -> Self {
        Self {
            id: entry.id,
            source_schema: entry.source_schema,
            source_table: entry.source_table,
            status: entry.status.to_string(),
            start_time: entry.start_time,
            end_time: entry.end_time,
            rows_copied: entry.rows_copied,
            source_row_count: entry.source_row_count,
            destination_row_count: entry.destination_row_count,
            validation_mismatch: entry.validation_mismatch,
            watermark_value: entry.watermark_value,
            error_message: entry.error_message,
        }
    }
}
