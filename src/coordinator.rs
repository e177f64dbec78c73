//! Run coordinator: one end-to-end ingestion run over every active table.
//!
//! Jobs are admitted to a bounded worker pool strictly in registry order
//! `(priority, source_schema, source_table)`. A worker slot is taken before a
//! job's task is spawned, so a later job can never start ahead of an earlier
//! one; completion order is unconstrained. Per-table failures are recorded
//! and counted, they never stop the run.
//!
//! Runs of one coordinator never overlap: a run waits for the previous one to
//! finish before it snapshots the registry, so it sees the watermarks that
//! run stored.

use crate::copy::CopyTask;
use crate::errors::FlowError;
use crate::jobs;
use crate::registry::{self, TableJob, TableRef};
use crate::storage::{ExecutionLogEntry, MasterRunEntry, RunStatus};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 5;

/// What started a run, stored on the master entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Cli,
    Schedule,
    Admin,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Cli => "cli",
            RunTrigger::Schedule => "schedule",
            RunTrigger::Admin => "admin",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Tally {
    succeeded: i64,
    failed: i64,
}

impl Tally {
    fn record(&mut self, status: RunStatus) {
        match status {
            RunStatus::Succeeded => self.succeeded += 1,
            _ => self.failed += 1,
        }
    }
}

type WorkerResult = (TableRef, Result<Result<ExecutionLogEntry, FlowError>, JoinError>);

pub struct RunCoordinator {
    db: DatabaseConnection,
    copy: Arc<CopyTask>,
    concurrency_limit: usize,
    run_guard: Mutex<()>,
}

impl RunCoordinator {
    pub fn new(db: DatabaseConnection, copy: CopyTask) -> Self {
        Self {
            db,
            copy: Arc::new(copy),
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            run_guard: Mutex::new(()),
        }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Identifier for a new run. Time-ordered, so later runs sort after earlier ones.
    pub fn new_run_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// Whether a run is in progress (or waiting to start)
    pub fn is_running(&self) -> bool {
        self.run_guard.try_lock().is_err()
    }

    /// Run with the configured concurrency limit
    pub async fn run(&self, trigger: RunTrigger) -> Result<MasterRunEntry, FlowError> {
        self.run_all(self.concurrency_limit, trigger).await
    }

    /// Run with the configured concurrency limit unless a run is already in
    /// progress, in which case `None` is returned and nothing is recorded.
    pub async fn try_run(&self, trigger: RunTrigger) -> Option<Result<MasterRunEntry, FlowError>> {
        let guard = self.run_guard.try_lock().ok()?;
        let run_id = Self::new_run_id();
        let result = self
            .execute_run(&run_id, self.concurrency_limit, trigger)
            .await;
        drop(guard);
        Some(result)
    }

    pub async fn run_all(
        &self,
        concurrency_limit: usize,
        trigger: RunTrigger,
    ) -> Result<MasterRunEntry, FlowError> {
        self.run_with_id(&Self::new_run_id(), concurrency_limit, trigger)
            .await
    }

    /// Execute one full run under the given id, after any run in progress.
    ///
    /// The returned entry is SUCCEEDED whenever the run completed, even if
    /// individual tables failed. It is FAILED when the registry could not be
    /// read or the run could not be driven to completion. `Err` is returned
    /// only when the outcome could not be recorded at all.
    pub async fn run_with_id(
        &self,
        run_id: &str,
        concurrency_limit: usize,
        trigger: RunTrigger,
    ) -> Result<MasterRunEntry, FlowError> {
        let _guard = self.run_guard.lock().await;
        self.execute_run(run_id, concurrency_limit, trigger).await
    }

    async fn execute_run(
        &self,
        run_id: &str,
        concurrency_limit: usize,
        trigger: RunTrigger,
    ) -> Result<MasterRunEntry, FlowError> {
        let run_id = run_id.to_string();
        let concurrency_limit = concurrency_limit.max(1);

        let snapshot = match registry::list_active_jobs(&self.db).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(%run_id, "Cannot read table registry: {}", e);
                return jobs::record_failed_master_run(&self.db, &run_id, trigger, &e.log_message())
                    .await;
            }
        };

        jobs::start_master_run(&self.db, &run_id, snapshot.len(), trigger).await?;
        info!(
            %run_id,
            tables = snapshot.len(),
            concurrency_limit,
            trigger = trigger.as_str(),
            "Run started"
        );

        let (status, tally, error_message) =
            match self.dispatch(&run_id, snapshot, concurrency_limit).await {
                Ok(tally) => (RunStatus::Succeeded, tally, None),
                Err((tally, e)) => {
                    error!(%run_id, "Run aborted: {}", e);
                    (RunStatus::Failed, tally, Some(e.log_message()))
                }
            };

        let run = jobs::complete_master_run(
            &self.db,
            &run_id,
            status,
            tally.succeeded,
            tally.failed,
            error_message,
        )
        .await?;

        info!(
            %run_id,
            status = %run.status,
            succeeded = run.successful_tables,
            failed = run.failed_tables,
            "Run finished"
        );
        Ok(run)
    }

    async fn dispatch(
        &self,
        run_id: &str,
        snapshot: Vec<TableJob>,
        concurrency_limit: usize,
    ) -> Result<Tally, (Tally, FlowError)> {
        let semaphore = Arc::new(Semaphore::new(concurrency_limit));
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let mut tally = Tally::default();

        for job in snapshot {
            let table = job.source();

            if let Err(e) = job.load_policy() {
                warn!(run_id, %table, "Rejecting table: {}", e);
                match jobs::record_rejected_execution(&self.db, run_id, &job, &e.log_message()).await
                {
                    Ok(entry) => tally.record(entry.status),
                    Err(log_err) => {
                        error!(run_id, %table, "Cannot record rejected table: {}", log_err);
                        tally.failed += 1;
                    }
                }
                continue;
            }

            // Wait for a free slot before spawning to keep admission in order
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let e = FlowError::Other("worker pool closed".to_string());
                    self.drain(run_id, &mut workers, &mut tally).await;
                    return Err((tally, e));
                }
            };

            let copy = self.copy.clone();
            let run = run_id.to_string();
            workers.spawn(async move {
                let _permit = permit;
                // Inner task so a panicking copy still reports which table it was
                let outcome = tokio::spawn(async move { copy.execute(&job, &run).await }).await;
                (table, outcome)
            });
        }

        self.drain(run_id, &mut workers, &mut tally).await;
        Ok(tally)
    }

    /// Wait for every dispatched worker and count its outcome
    async fn drain(&self, run_id: &str, workers: &mut JoinSet<WorkerResult>, tally: &mut Tally) {
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(Ok(entry)))) => tally.record(entry.status),
                Ok((table, Ok(Err(e)))) => {
                    error!(run_id, %table, "Copy could not be recorded: {}", e);
                    self.fail_leftovers(run_id, &table, &e.log_message()).await;
                    tally.failed += 1;
                }
                Ok((table, Err(join_err))) => {
                    error!(run_id, %table, "Copy worker died: {}", join_err);
                    self.fail_leftovers(run_id, &table, &format!("worker died: {}", join_err))
                        .await;
                    tally.failed += 1;
                }
                Err(join_err) => {
                    error!(run_id, "Worker slot died: {}", join_err);
                    tally.failed += 1;
                }
            }
        }
    }

    async fn fail_leftovers(&self, run_id: &str, table: &TableRef, message: &str) {
        if let Err(e) =
            jobs::fail_running_executions(&self.db, run_id, &table.schema, &table.name, message)
                .await
        {
            error!(run_id, %table, "Cannot close execution entry: {}", e);
        }
    }
}
