use crate::entities;
use crate::errors::FlowError;
use crate::settings::Database as DbCfg;
use migration::MigratorTrait;
use sea_orm::{
    ColumnTrait, Database, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status shared by execution log entries and master runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCEEDED" => Ok(RunStatus::Succeeded),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(FlowError::Other(format!("unknown status `{}`", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: i64,
    pub run_id: String,
    pub source_schema: String,
    pub source_table: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: RunStatus,
    pub rows_copied: Option<i64>,
    pub source_row_count: Option<i64>,
    pub destination_row_count: Option<i64>,
    pub validation_mismatch: bool,
    pub watermark_value: Option<String>,
    pub error_message: Option<String>,
}

impl TryFrom<entities::execution_log::Model> for ExecutionLogEntry {
    type Error = FlowError;

    fn try_from(m: entities::execution_log::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: m.id,
            status: m.status.parse()?,
            run_id: m.run_id,
            source_schema: m.source_schema,
            source_table: m.source_table,
            start_time: m.start_time,
            end_time: m.end_time,
            rows_copied: m.rows_copied,
            source_row_count: m.source_row_count,
            destination_row_count: m.destination_row_count,
            validation_mismatch: m.validation_mismatch,
            watermark_value: m.watermark_value,
            error_message: m.error_message,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRunEntry {
    pub run_id: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: RunStatus,
    pub table_count: i64,
    pub successful_tables: i64,
    pub failed_tables: i64,
    pub error_message: Option<String>,
    pub triggered_by: String,
}

impl TryFrom<entities::master_execution_log::Model> for MasterRunEntry {
    type Error = FlowError;

    fn try_from(m: entities::master_execution_log::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            status: m.status.parse()?,
            run_id: m.run_id,
            start_time: m.start_time,
            end_time: m.end_time,
            table_count: m.table_count,
            successful_tables: m.successful_tables,
            failed_tables: m.failed_tables,
            error_message: m.error_message,
            triggered_by: m.triggered_by,
        })
    }
}

/// Connect to the control-plane database and bring its schema up to date
pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, FlowError> {
    let db = Database::connect(&cfg.url).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

pub async fn get_execution(
    db: &DatabaseConnection,
    id: i64,
) -> Result<Option<ExecutionLogEntry>, FlowError> {
    use entities::execution_log::Entity;

    Entity::find_by_id(id)
        .one(db)
        .await?
        .map(ExecutionLogEntry::try_from)
        .transpose()
}

/// Execution entries of one run, oldest first
pub async fn list_executions(
    db: &DatabaseConnection,
    run_id: &str,
) -> Result<Vec<ExecutionLogEntry>, FlowError> {
    use entities::execution_log::{Column, Entity};

    Entity::find()
        .filter(Column::RunId.eq(run_id))
        .order_by_asc(Column::Id)
        .all(db)
        .await?
        .into_iter()
        .map(ExecutionLogEntry::try_from)
        .collect()
}

/// Up to `limit` execution entries of one run, oldest first, optionally only
/// the FAILED ones
pub async fn list_run_executions(
    db: &DatabaseConnection,
    run_id: &str,
    only_failures: bool,
    limit: u64,
) -> Result<Vec<ExecutionLogEntry>, FlowError> {
    use entities::execution_log::{Column, Entity};

    let mut query = Entity::find().filter(Column::RunId.eq(run_id));
    if only_failures {
        query = query.filter(Column::Status.eq(RunStatus::Failed.as_str()));
    }

    query
        .order_by_asc(Column::Id)
        .limit(limit)
        .all(db)
        .await?
        .into_iter()
        .map(ExecutionLogEntry::try_from)
        .collect()
}

/// Most recent executions of one source table, newest first
pub async fn list_table_history(
    db: &DatabaseConnection,
    source_schema: &str,
    source_table: &str,
    limit: u64,
) -> Result<Vec<ExecutionLogEntry>, FlowError> {
    use entities::execution_log::{Column, Entity};

    Entity::find()
        .filter(Column::SourceSchema.eq(source_schema))
        .filter(Column::SourceTable.eq(source_table))
        .order_by_desc(Column::Id)
        .limit(limit)
        .all(db)
        .await?
        .into_iter()
        .map(ExecutionLogEntry::try_from)
        .collect()
}

/// Number of execution entries currently in RUNNING state, across all runs
pub async fn count_running_executions(db: &DatabaseConnection) -> Result<u64, FlowError> {
    use entities::execution_log::{Column, Entity};

    let count = Entity::find()
        .filter(Column::Status.eq(RunStatus::Running.as_str()))
        .count(db)
        .await?;
    Ok(count)
}

pub async fn get_master_run(
    db: &DatabaseConnection,
    run_id: &str,
) -> Result<Option<MasterRunEntry>, FlowError> {
    use entities::master_execution_log::Entity;

    Entity::find_by_id(run_id.to_string())
        .one(db)
        .await?
        .map(MasterRunEntry::try_from)
        .transpose()
}

/// Most recent runs first. Run ids are time-ordered and break ties between
/// runs started within the same second.
pub async fn list_master_runs(
    db: &DatabaseConnection,
    limit: u64,
) -> Result<Vec<MasterRunEntry>, FlowError> {
    use entities::master_execution_log::{Column, Entity};

    Entity::find()
        .order_by_desc(Column::StartTime)
        .order_by_desc(Column::RunId)
        .limit(limit)
        .all(db)
        .await?
        .into_iter()
        .map(MasterRunEntry::try_from)
        .collect()
}
