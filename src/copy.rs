//! Per-table copy task.
//!
//! A copy owns exactly one execution log entry and, for incremental loads,
//! the watermark of its own table. Sources are read page by page, each page
//! written before the next is fetched. FULL loads truncate the destination
//! once the first page has been read; there is no rollback, so a FULL load
//! failing later can leave the destination partial until the next run.

use crate::errors::FlowError;
use crate::jobs::{self, ExecutionOutcome};
use crate::registry::{self, LoadPolicy, TableJob, TableRef};
use crate::storage::{self, ExecutionLogEntry, RunStatus};
use crate::watermark;
use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One source row, keyed by column name
pub type Row = Map<String, Value>;

/// Restricts a scan to rows whose `column` is strictly greater than `after`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkFilter {
    pub column: String,
    pub after: String,
}

/// One page of a source scan.
///
/// Pages are addressed by offset in a stable order: by `order_by` when set,
/// then by the backend's physical row order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page<'a> {
    pub order_by: Option<&'a str>,
    pub filter: Option<&'a WatermarkFilter>,
    pub offset: u64,
    pub limit: u64,
}

#[async_trait]
pub trait SourceReader: Send + Sync {
    /// At most `page.limit` rows of `table`, starting at `page.offset`
    async fn read_rows(&self, table: &TableRef, page: Page<'_>) -> Result<Vec<Row>, FlowError>;

    /// Row count obtained independently of `read_rows`, used for validation
    async fn count_rows(
        &self,
        table: &TableRef,
        filter: Option<&WatermarkFilter>,
    ) -> Result<u64, FlowError>;
}

#[async_trait]
pub trait DestinationWriter: Send + Sync {
    async fn truncate(&self, table: &TableRef) -> Result<(), FlowError>;

    /// Append rows and return how many were written
    async fn append_rows(&self, table: &TableRef, rows: &[Row]) -> Result<u64, FlowError>;

    async fn count_rows(&self, table: &TableRef) -> Result<u64, FlowError>;
}

/// Result of a transfer before it is written to the log
#[derive(Debug, Clone, PartialEq, Eq)]
struct TransferStats {
    rows_copied: u64,
    source_row_count: u64,
    destination_row_count: u64,
    max_watermark: Option<String>,
}

pub struct CopyTask {
    db: DatabaseConnection,
    source: Arc<dyn SourceReader>,
    destination: Arc<dyn DestinationWriter>,
    batch_size: usize,
    timeout: Duration,
}

impl CopyTask {
    pub fn new(
        db: DatabaseConnection,
        source: Arc<dyn SourceReader>,
        destination: Arc<dyn DestinationWriter>,
    ) -> Self {
        Self {
            db,
            source,
            destination,
            batch_size: 1000,
            timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Copy one table and record the outcome.
    ///
    /// Copy failures end up in the returned entry as FAILED. An `Err` means
    /// the execution log itself could not be written.
    pub async fn execute(
        &self,
        job: &TableJob,
        run_id: &str,
    ) -> Result<ExecutionLogEntry, FlowError> {
        let table = job.source();
        let execution_id = jobs::start_table_execution(&self.db, run_id, job).await?;
        info!(run_id, %table, execution_id, load_type = %job.load_type, "Copy started");

        let outcome = match self.copy_and_advance(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(run_id, %table, "Copy failed: {}", e);
                ExecutionOutcome::failed(e.log_message())
            }
        };

        jobs::complete_table_execution(&self.db, execution_id, outcome).await?;

        let entry = storage::get_execution(&self.db, execution_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("execution {}", execution_id)))?;

        if entry.status == RunStatus::Succeeded {
            info!(
                run_id,
                %table,
                rows_copied = entry.rows_copied.unwrap_or_default(),
                "Copy succeeded"
            );
        }
        Ok(entry)
    }

    async fn copy_and_advance(&self, job: &TableJob) -> Result<ExecutionOutcome, FlowError> {
        let policy = job.load_policy()?;

        let stats = match tokio::time::timeout(self.timeout, self.transfer(job, &policy)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(FlowError::DataTransfer(format!(
                    "copy of {} timed out after {:?}",
                    job.source(),
                    self.timeout
                )))
            }
        };

        let validation_mismatch = stats.source_row_count != stats.destination_row_count;
        if validation_mismatch {
            warn!(
                table = %job.source(),
                source_rows = stats.source_row_count,
                destination_rows = stats.destination_row_count,
                "Row count validation mismatch"
            );
        }

        let watermark_value = match policy {
            LoadPolicy::Full => None,
            LoadPolicy::Incremental { after, .. } => {
                match watermark::advance(after.as_deref(), stats.max_watermark.as_deref()) {
                    Some(next) if Some(&next) != after.as_ref() => {
                        let stored = registry::update_watermark(
                            &self.db,
                            &job.source_schema,
                            &job.source_table,
                            &next,
                        )
                        .await?;
                        match stored {
                            Some(stored) => {
                                if stored != next {
                                    debug!(table = %job.source(), %stored, "Stored watermark is already ahead");
                                }
                                Some(stored)
                            }
                            None => {
                                debug!(table = %job.source(), "Job deactivated during copy, watermark not stored");
                                Some(next)
                            }
                        }
                    }
                    unchanged => unchanged,
                }
            }
        };

        Ok(ExecutionOutcome {
            status: RunStatus::Succeeded,
            rows_copied: Some(stats.rows_copied as i64),
            source_row_count: Some(stats.source_row_count as i64),
            destination_row_count: Some(stats.destination_row_count as i64),
            validation_mismatch,
            watermark_value,
            error_message: None,
        })
    }

    async fn transfer(
        &self,
        job: &TableJob,
        policy: &LoadPolicy,
    ) -> Result<TransferStats, FlowError> {
        let source = job.source();
        let destination = job.destination();
        let limit = self.batch_size as u64;

        match policy {
            LoadPolicy::Full => {
                let mut rows_copied = 0;
                let mut offset = 0;
                loop {
                    let page = Page {
                        order_by: None,
                        filter: None,
                        offset,
                        limit,
                    };
                    let rows = self.source.read_rows(&source, page).await?;
                    // Truncate only once the source has proven readable
                    if offset == 0 {
                        self.destination.truncate(&destination).await?;
                    }
                    rows_copied += self.write(&destination, &rows).await?;
                    if (rows.len() as u64) < limit {
                        break;
                    }
                    offset += rows.len() as u64;
                }

                Ok(TransferStats {
                    rows_copied,
                    source_row_count: self.source.count_rows(&source, None).await?,
                    destination_row_count: self.destination.count_rows(&destination).await?,
                    max_watermark: None,
                })
            }
            LoadPolicy::Incremental { column, after } => {
                let filter = after.as_ref().map(|after| WatermarkFilter {
                    column: column.clone(),
                    after: after.clone(),
                });

                let mut rows_copied = 0;
                let mut max_watermark: Option<String> = None;
                let mut offset = 0;
                loop {
                    let page = Page {
                        order_by: Some(column.as_str()),
                        filter: filter.as_ref(),
                        offset,
                        limit,
                    };
                    let rows = self.source.read_rows(&source, page).await?;
                    rows_copied += self.write(&destination, &rows).await?;

                    let observed: Vec<String> = rows
                        .iter()
                        .filter_map(|row| row.get(column.as_str()).and_then(watermark::from_json))
                        .collect();
                    let page_max = watermark::max(observed.iter().map(String::as_str));
                    max_watermark = watermark::advance(max_watermark.as_deref(), page_max.as_deref());

                    if (rows.len() as u64) < limit {
                        break;
                    }
                    offset += rows.len() as u64;
                }

                if rows_copied > 0 && max_watermark.is_none() {
                    return Err(FlowError::DataTransfer(format!(
                        "watermark column `{}` has no values in rows copied from {}",
                        column, source
                    )));
                }

                Ok(TransferStats {
                    rows_copied,
                    source_row_count: self.source.count_rows(&source, filter.as_ref()).await?,
                    destination_row_count: rows_copied,
                    max_watermark,
                })
            }
        }
    }

    async fn write(&self, table: &TableRef, rows: &[Row]) -> Result<u64, FlowError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.destination.append_rows(table, rows).await
    }
}
