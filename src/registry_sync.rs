use crate::registry::{self, LoadType, NewTableJob, TableJob, TableJobChanges};
use miette::{IntoDiagnostic, Result};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::fs;

/// Table definition from JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDefinition {
    pub source_schema: String,
    pub source_table: String,
    /// Defaults to the source schema
    #[serde(default)]
    pub destination_schema: Option<String>,
    /// Defaults to the source table
    #[serde(default)]
    pub destination_table: Option<String>,
    pub load_type: LoadType,
    #[serde(default)]
    pub watermark_column: Option<String>,
    /// Only used when the table is created; existing watermarks are never reset
    #[serde(default)]
    pub initial_watermark_value: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    100
}

impl TableDefinition {
    fn changes(&self) -> TableJobChanges {
        TableJobChanges {
            destination_schema: self
                .destination_schema
                .clone()
                .unwrap_or_else(|| self.source_schema.clone()),
            destination_table: self
                .destination_table
                .clone()
                .unwrap_or_else(|| self.source_table.clone()),
            load_type: self.load_type,
            watermark_column: self.watermark_column.clone(),
            is_active: self.is_active,
            priority: self.priority,
        }
    }

    fn matches(&self, job: &TableJob) -> bool {
        let wanted = self.changes();
        job.destination_schema == wanted.destination_schema
            && job.destination_table == wanted.destination_table
            && job.load_type == wanted.load_type.as_str()
            && job.watermark_column == wanted.watermark_column
            && job.is_active == wanted.is_active
            && job.priority == wanted.priority
    }
}

/// Root structure of the tables JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablesFile {
    pub tables: Vec<TableDefinition>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Sync table definitions from a JSON file to the registry (idempotent)
pub async fn sync_tables_from_file(db: &DatabaseConnection, file_path: &str) -> Result<SyncSummary> {
    tracing::info!("Loading table definitions from {}", file_path);

    let content = fs::read_to_string(file_path)
        .into_diagnostic()
        .map_err(|e| miette::miette!("Failed to read tables file at '{}': {}", file_path, e))?;

    let tables_file: TablesFile = serde_json::from_str(&content)
        .into_diagnostic()
        .map_err(|e| {
            miette::miette!(
                "Failed to parse tables JSON file: {}\n\nExpected format:\n{{\n  \"tables\": [\n    {{\n      \"source_schema\": \"dbo\",\n      \"source_table\": \"orders\",\n      \"destination_schema\": \"raw\",\n      \"load_type\": \"INCREMENTAL\",\n      \"watermark_column\": \"modified_at\",\n      \"priority\": 1\n    }}\n  ]\n}}",
                e
            )
        })?;

    sync_tables(db, &tables_file.tables).await
}

pub async fn sync_tables(
    db: &DatabaseConnection,
    definitions: &[TableDefinition],
) -> Result<SyncSummary> {
    tracing::info!("Found {} table(s) to sync", definitions.len());

    let mut summary = SyncSummary::default();
    for definition in definitions {
        match sync_table(db, definition).await? {
            SyncResult::Created => summary.created += 1,
            SyncResult::Updated => summary.updated += 1,
            SyncResult::Unchanged => summary.unchanged += 1,
        }
    }

    tracing::info!(
        "Table sync complete: {} created, {} updated, {} unchanged",
        summary.created,
        summary.updated,
        summary.unchanged
    );

    Ok(summary)
}

#[derive(Debug)]
enum SyncResult {
    Created,
    Updated,
    Unchanged,
}

async fn sync_table(db: &DatabaseConnection, definition: &TableDefinition) -> Result<SyncResult> {
    let existing = registry::get_table_job(db, &definition.source_schema, &definition.source_table)
        .await
        .into_diagnostic()?;

    let result = match existing {
        None => {
            tracing::info!(
                "Registering table: {}.{}",
                definition.source_schema,
                definition.source_table
            );
            let changes = definition.changes();
            let job = registry::insert_table_job(
                db,
                NewTableJob {
                    source_schema: definition.source_schema.clone(),
                    source_table: definition.source_table.clone(),
                    destination_schema: changes.destination_schema,
                    destination_table: changes.destination_table,
                    load_type: changes.load_type,
                    watermark_column: changes.watermark_column,
                    last_watermark_value: definition.initial_watermark_value.clone(),
                    is_active: changes.is_active,
                    priority: changes.priority,
                },
            )
            .await
            .into_diagnostic()?;
            warn_if_invalid(&job);
            SyncResult::Created
        }
        Some(job) if definition.matches(&job) => SyncResult::Unchanged,
        Some(_) => {
            tracing::info!(
                "Updating table: {}.{}",
                definition.source_schema,
                definition.source_table
            );
            let job = registry::update_table_job(
                db,
                &definition.source_schema,
                &definition.source_table,
                definition.changes(),
            )
            .await
            .into_diagnostic()?;
            warn_if_invalid(&job);
            SyncResult::Updated
        }
    };

    Ok(result)
}

// Invalid rows are stored anyway; runs reject them and log them as FAILED
fn warn_if_invalid(job: &TableJob) {
    if let Err(e) = job.load_policy() {
        tracing::warn!("{} will fail at run time: {}", job.source(), e);
    }
}
