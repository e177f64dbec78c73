//! Table registry: the `table_config` control table that drives every run.
//!
//! Each row describes one source table, where it lands, and how it is loaded.
//! Runs read a snapshot of the active rows ordered by
//! `(priority, source_schema, source_table)`.

use crate::entities;
use crate::errors::FlowError;
use crate::watermark;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    SqlErr,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const WATERMARK_WRITE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoadType {
    Full,
    Incremental,
}

impl LoadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadType::Full => "FULL",
            LoadType::Incremental => "INCREMENTAL",
        }
    }
}

impl fmt::Display for LoadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadType {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FULL" => Ok(LoadType::Full),
            "INCREMENTAL" => Ok(LoadType::Incremental),
            other => Err(FlowError::Configuration(format!(
                "unknown load type `{}`",
                other
            ))),
        }
    }
}

/// Schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.table`
    pub fn parse(qualified: &str) -> Result<Self, FlowError> {
        match qualified.split_once('.') {
            Some((schema, name)) if !schema.is_empty() && !name.is_empty() => {
                Ok(Self::new(schema, name))
            }
            _ => Err(FlowError::Configuration(format!(
                "expected `schema.table`, got `{}`",
                qualified
            ))),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// One row of the table registry.
///
/// `load_type` is kept as stored so that a malformed row can still be
/// scheduled, rejected by [`TableJob::load_policy`] and logged as FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableJob {
    pub id: i64,
    pub source_schema: String,
    pub source_table: String,
    pub destination_schema: String,
    pub destination_table: String,
    pub load_type: String,
    pub watermark_column: Option<String>,
    pub last_watermark_value: Option<String>,
    pub is_active: bool,
    pub priority: i32,
    pub created_date: i64,
    pub modified_date: i64,
}

/// Validated load strategy of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Truncate the destination, then copy every source row
    Full,
    /// Append rows whose `column` is strictly greater than `after`.
    /// `after = None` copies all rows.
    Incremental {
        column: String,
        after: Option<String>,
    },
}

impl TableJob {
    pub fn source(&self) -> TableRef {
        TableRef::new(&self.source_schema, &self.source_table)
    }

    pub fn destination(&self) -> TableRef {
        TableRef::new(&self.destination_schema, &self.destination_table)
    }

    /// Validate the row and return its load strategy.
    ///
    /// A watermark column must be present iff the load type is INCREMENTAL.
    pub fn load_policy(&self) -> Result<LoadPolicy, FlowError> {
        for (field, value) in [
            ("source_schema", &self.source_schema),
            ("source_table", &self.source_table),
            ("destination_schema", &self.destination_schema),
            ("destination_table", &self.destination_table),
        ] {
            if value.trim().is_empty() {
                return Err(FlowError::Configuration(format!(
                    "{} for {} is empty",
                    field,
                    self.source()
                )));
            }
        }

        let load_type: LoadType = self.load_type.parse().map_err(|_| {
            FlowError::Configuration(format!(
                "unknown load type `{}` for {}",
                self.load_type,
                self.source()
            ))
        })?;

        let column = self
            .watermark_column
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        match (load_type, column) {
            (LoadType::Full, None) => Ok(LoadPolicy::Full),
            (LoadType::Full, Some(column)) => Err(FlowError::Configuration(format!(
                "FULL load for {} must not set watermark column `{}`",
                self.source(),
                column
            ))),
            (LoadType::Incremental, Some(column)) => Ok(LoadPolicy::Incremental {
                column: column.to_string(),
                after: self.last_watermark_value.clone(),
            }),
            (LoadType::Incremental, None) => Err(FlowError::Configuration(format!(
                "INCREMENTAL load for {} has no watermark column",
                self.source()
            ))),
        }
    }
}

impl From<entities::table_config::Model> for TableJob {
    fn from(m: entities::table_config::Model) -> Self {
        Self {
            id: m.id,
            source_schema: m.source_schema,
            source_table: m.source_table,
            destination_schema: m.destination_schema,
            destination_table: m.destination_table,
            load_type: m.load_type,
            watermark_column: m.watermark_column,
            last_watermark_value: m.last_watermark_value,
            is_active: m.is_active,
            priority: m.priority,
            created_date: m.created_date,
            modified_date: m.modified_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTableJob {
    pub source_schema: String,
    pub source_table: String,
    pub destination_schema: String,
    pub destination_table: String,
    pub load_type: LoadType,
    pub watermark_column: Option<String>,
    pub last_watermark_value: Option<String>,
    pub is_active: bool,
    pub priority: i32,
}

/// Operator-editable fields. The watermark is owned by the copy task and is
/// only changed through [`update_watermark`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableJobChanges {
    pub destination_schema: String,
    pub destination_table: String,
    pub load_type: LoadType,
    pub watermark_column: Option<String>,
    pub is_active: bool,
    pub priority: i32,
}

pub async fn insert_table_job(
    db: &DatabaseConnection,
    input: NewTableJob,
) -> Result<TableJob, FlowError> {
    if get_table_job(db, &input.source_schema, &input.source_table)
        .await?
        .is_some()
    {
        return Err(FlowError::UniquenessViolation {
            schema: input.source_schema,
            table: input.source_table,
        });
    }

    let now = Utc::now().timestamp();
    let row = entities::table_config::ActiveModel {
        source_schema: Set(input.source_schema.clone()),
        source_table: Set(input.source_table.clone()),
        destination_schema: Set(input.destination_schema),
        destination_table: Set(input.destination_table),
        load_type: Set(input.load_type.as_str().to_string()),
        watermark_column: Set(input.watermark_column),
        last_watermark_value: Set(input.last_watermark_value),
        is_active: Set(input.is_active),
        priority: Set(input.priority),
        created_date: Set(now),
        modified_date: Set(now),
        ..Default::default()
    };

    // The unique index still guards against a concurrent insert of the same key
    match row.insert(db).await {
        Ok(model) => Ok(model.into()),
        Err(e) => match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => Err(FlowError::UniquenessViolation {
                schema: input.source_schema,
                table: input.source_table,
            }),
            _ => Err(e.into()),
        },
    }
}

pub async fn get_table_job(
    db: &DatabaseConnection,
    source_schema: &str,
    source_table: &str,
) -> Result<Option<TableJob>, FlowError> {
    use entities::table_config::{Column, Entity};

    let model = Entity::find()
        .filter(Column::SourceSchema.eq(source_schema))
        .filter(Column::SourceTable.eq(source_table))
        .one(db)
        .await?;

    Ok(model.map(TableJob::from))
}

/// Active jobs in scheduling order
pub async fn list_active_jobs(db: &DatabaseConnection) -> Result<Vec<TableJob>, FlowError> {
    use entities::table_config::{Column, Entity};

    let models = Entity::find()
        .filter(Column::IsActive.eq(true))
        .order_by_asc(Column::Priority)
        .order_by_asc(Column::SourceSchema)
        .order_by_asc(Column::SourceTable)
        .all(db)
        .await?;

    Ok(models.into_iter().map(TableJob::from).collect())
}

/// Every registered job, active or not, in scheduling order
pub async fn list_all_jobs(db: &DatabaseConnection) -> Result<Vec<TableJob>, FlowError> {
    use entities::table_config::{Column, Entity};

    let models = Entity::find()
        .order_by_asc(Column::Priority)
        .order_by_asc(Column::SourceSchema)
        .order_by_asc(Column::SourceTable)
        .all(db)
        .await?;

    Ok(models.into_iter().map(TableJob::from).collect())
}

/// Move the stored watermark of an active job forward to `value`.
///
/// The stored value never moves backwards: a `value` that does not compare
/// greater than what is stored leaves the row untouched. The write is a
/// compare-and-swap on the previously stored value, so concurrent writers
/// cannot overwrite a newer watermark with an older one.
///
/// Returns the stored watermark afterwards, or `None` when the job is missing
/// or was deactivated in the meantime.
pub async fn update_watermark(
    db: &DatabaseConnection,
    source_schema: &str,
    source_table: &str,
    value: &str,
) -> Result<Option<String>, FlowError> {
    use entities::table_config::{Column, Entity};

    for _ in 0..WATERMARK_WRITE_ATTEMPTS {
        let Some(model) = Entity::find()
            .filter(Column::SourceSchema.eq(source_schema))
            .filter(Column::SourceTable.eq(source_table))
            .filter(Column::IsActive.eq(true))
            .one(db)
            .await?
        else {
            return Ok(None);
        };

        let current = model.last_watermark_value;
        let next = watermark::advance(current.as_deref(), Some(value));
        if next == current {
            return Ok(current);
        }

        let swap = Entity::update_many()
            .col_expr(Column::LastWatermarkValue, Expr::value(next.clone()))
            .col_expr(Column::ModifiedDate, Expr::value(Utc::now().timestamp()))
            .filter(Column::Id.eq(model.id))
            .filter(Column::IsActive.eq(true));
        let swap = match &current {
            Some(stored) => swap.filter(Column::LastWatermarkValue.eq(stored.clone())),
            None => swap.filter(Column::LastWatermarkValue.is_null()),
        };

        if swap.exec(db).await?.rows_affected > 0 {
            return Ok(next);
        }
        tracing::debug!(
            "Watermark of {}.{} changed concurrently, retrying",
            source_schema,
            source_table
        );
    }

    Err(FlowError::Other(format!(
        "watermark of {}.{} kept changing, gave up after {} attempts",
        source_schema, source_table, WATERMARK_WRITE_ATTEMPTS
    )))
}

/// Returns `false` when no job matches
pub async fn set_active(
    db: &DatabaseConnection,
    source_schema: &str,
    source_table: &str,
    active: bool,
) -> Result<bool, FlowError> {
    use entities::table_config::{Column, Entity};

    let now = Utc::now().timestamp();
    let result = Entity::update_many()
        .col_expr(Column::IsActive, Expr::value(active))
        .col_expr(Column::ModifiedDate, Expr::value(now))
        .filter(Column::SourceSchema.eq(source_schema))
        .filter(Column::SourceTable.eq(source_table))
        .exec(db)
        .await?;

    Ok(result.rows_affected > 0)
}

pub async fn update_table_job(
    db: &DatabaseConnection,
    source_schema: &str,
    source_table: &str,
    changes: TableJobChanges,
) -> Result<TableJob, FlowError> {
    use entities::table_config::{Column, Entity};

    let model = Entity::find()
        .filter(Column::SourceSchema.eq(source_schema))
        .filter(Column::SourceTable.eq(source_table))
        .one(db)
        .await?
        .ok_or_else(|| FlowError::NotFound(format!("table {}.{}", source_schema, source_table)))?;

    let mut active: entities::table_config::ActiveModel = model.into();
    active.destination_schema = Set(changes.destination_schema);
    active.destination_table = Set(changes.destination_table);
    active.load_type = Set(changes.load_type.as_str().to_string());
    active.watermark_column = Set(changes.watermark_column);
    active.is_active = Set(changes.is_active);
    active.priority = Set(changes.priority);
    active.modified_date = Set(Utc::now().timestamp());

    let updated = active.update(db).await?;
    Ok(updated.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Database;
    use sea_orm_migration::MigratorTrait;
    use tempfile::NamedTempFile;

    /// Test database helper that keeps temp file alive
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

    fn new_job(schema: &str, table: &str, priority: i32) -> NewTableJob {
        NewTableJob {
            source_schema: schema.to_string(),
            source_table: table.to_string(),
            destination_schema: "stage".to_string(),
            destination_table: table.to_string(),
            load_type: LoadType::Full,
            watermark_column: None,
            last_watermark_value: None,
            is_active: true,
            priority,
        }
    }

    fn incremental(schema: &str, table: &str, priority: i32) -> NewTableJob {
        NewTableJob {
            load_type: LoadType::Incremental,
            watermark_column: Some("modified_at".to_string()),
            ..new_job(schema, table, priority)
        }
    }

    // ============================================================================
    // Listing
    // ============================================================================

    #[tokio::test]
    async fn test_list_active_jobs_sorted_and_filtered() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        for job in [
            new_job("sales", "orders", 2),
            new_job("dbo", "customers", 1),
            new_job("dbo", "accounts", 2),
            new_job("archive", "orders", 1),
            NewTableJob {
                is_active: false,
                ..new_job("aaa", "inactive", 0)
            },
        ] {
            insert_table_job(db, job).await.expect("Failed to insert job");
        }

        let jobs = list_active_jobs(db).await.expect("Failed to list jobs");
        let order: Vec<String> = jobs.iter().map(|j| j.source().to_string()).collect();

        assert_eq!(
            order,
            vec![
                "archive.orders",
                "dbo.customers",
                "dbo.accounts",
                "sales.orders"
            ]
        );
        assert!(jobs.iter().all(|j| j.is_active));

        let all = list_all_jobs(db).await.expect("Failed to list jobs");
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].source().to_string(), "aaa.inactive");
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        insert_table_job(db, new_job("dbo", "orders", 1))
            .await
            .expect("Failed to insert job");

        let err = insert_table_job(db, new_job("dbo", "orders", 5))
            .await
            .expect_err("Duplicate key must fail");
        assert!(matches!(err, FlowError::UniquenessViolation { .. }));

        // Same table name in another schema is a different key
        insert_table_job(db, new_job("sales", "orders", 1))
            .await
            .expect("Different schema should be accepted");
    }

    // ============================================================================
    // Watermark and activation
    // ============================================================================

    #[tokio::test]
    async fn test_update_watermark_idempotent() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        insert_table_job(db, incremental("dbo", "orders", 1))
            .await
            .expect("Failed to insert job");

        assert_eq!(
            update_watermark(db, "dbo", "orders", "2024-02-01")
                .await
                .expect("Failed to update watermark"),
            Some("2024-02-01".to_string())
        );
        let first = get_table_job(db, "dbo", "orders")
            .await
            .expect("Failed to get job")
            .expect("Job not found");

        assert_eq!(
            update_watermark(db, "dbo", "orders", "2024-02-01")
                .await
                .expect("Failed to update watermark"),
            Some("2024-02-01".to_string())
        );
        let second = get_table_job(db, "dbo", "orders")
            .await
            .expect("Failed to get job")
            .expect("Job not found");

        assert_eq!(
            first.last_watermark_value,
            Some("2024-02-01".to_string())
        );
        // Everything but modified_date is unchanged
        assert_eq!(
            TableJob {
                modified_date: 0,
                ..first.clone()
            },
            TableJob {
                modified_date: 0,
                ..second.clone()
            }
        );
        assert!(second.modified_date >= first.modified_date);
    }

    #[tokio::test]
    async fn test_update_watermark_on_inactive_job_is_noop() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        insert_table_job(db, incremental("dbo", "orders", 1))
            .await
            .expect("Failed to insert job");
        assert!(set_active(db, "dbo", "orders", false)
            .await
            .expect("Failed to deactivate"));

        let updated = update_watermark(db, "dbo", "orders", "2024-02-01")
            .await
            .expect("Update on inactive job must not error");
        assert_eq!(updated, None);

        let job = get_table_job(db, "dbo", "orders")
            .await
            .expect("Failed to get job")
            .expect("Job not found");
        assert_eq!(job.last_watermark_value, None);

        // Missing job is also a no-op
        assert_eq!(
            update_watermark(db, "dbo", "missing", "x")
                .await
                .expect("Update on missing job must not error"),
            None
        );
    }

    #[tokio::test]
    async fn test_update_watermark_never_moves_backwards() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        insert_table_job(db, incremental("dbo", "orders", 1))
            .await
            .expect("Failed to insert job");

        update_watermark(db, "dbo", "orders", "2024-03-01")
            .await
            .unwrap();
        let stored = update_watermark(db, "dbo", "orders", "2024-02-01")
            .await
            .expect("Stale update must not error");
        assert_eq!(stored, Some("2024-03-01".to_string()));

        // Numeric watermarks compare as numbers
        insert_table_job(db, incremental("dbo", "events", 2))
            .await
            .unwrap();
        update_watermark(db, "dbo", "events", "9").await.unwrap();
        let stored = update_watermark(db, "dbo", "events", "10").await.unwrap();
        assert_eq!(stored, Some("10".to_string()));

        let job = get_table_job(db, "dbo", "orders").await.unwrap().unwrap();
        assert_eq!(job.last_watermark_value, Some("2024-03-01".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_watermark_writes_keep_the_largest() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        insert_table_job(db, incremental("dbo", "orders", 1))
            .await
            .expect("Failed to insert job");

        let values = ["2024-01-05", "2024-01-09", "2024-01-02", "2024-01-07"];
        let results = write_concurrently(db, &values).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let job = get_table_job(db, "dbo", "orders").await.unwrap().unwrap();
        assert_eq!(job.last_watermark_value, Some("2024-01-09".to_string()));
    }

    async fn write_concurrently(
        db: &DatabaseConnection,
        values: &[&str],
    ) -> Vec<Result<Option<String>, FlowError>> {
        let mut tasks = tokio::task::JoinSet::new();
        for value in values {
            let db = db.clone();
            let value = value.to_string();
            tasks.spawn(async move { update_watermark(&db, "dbo", "orders", &value).await });
        }
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.expect("Watermark task panicked"));
        }
        results
    }

    #[tokio::test]
    async fn test_set_active_excludes_from_listing() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        insert_table_job(db, new_job("dbo", "orders", 1))
            .await
            .expect("Failed to insert job");
        insert_table_job(db, new_job("dbo", "customers", 2))
            .await
            .expect("Failed to insert job");

        set_active(db, "dbo", "orders", false)
            .await
            .expect("Failed to deactivate");
        let jobs = list_active_jobs(db).await.expect("Failed to list jobs");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source_table, "customers");

        set_active(db, "dbo", "orders", true)
            .await
            .expect("Failed to activate");
        assert_eq!(list_active_jobs(db).await.unwrap().len(), 2);

        assert!(!set_active(db, "dbo", "missing", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_table_job_keeps_watermark() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        insert_table_job(db, incremental("dbo", "orders", 1))
            .await
            .expect("Failed to insert job");
        update_watermark(db, "dbo", "orders", "42").await.unwrap();

        let updated = update_table_job(
            db,
            "dbo",
            "orders",
            TableJobChanges {
                destination_schema: "raw".to_string(),
                destination_table: "orders_v2".to_string(),
                load_type: LoadType::Incremental,
                watermark_column: Some("order_id".to_string()),
                is_active: true,
                priority: 7,
            },
        )
        .await
        .expect("Failed to update job");

        assert_eq!(updated.destination().to_string(), "raw.orders_v2");
        assert_eq!(updated.priority, 7);
        assert_eq!(updated.last_watermark_value, Some("42".to_string()));

        let err = update_table_job(
            db,
            "dbo",
            "missing",
            TableJobChanges {
                destination_schema: "raw".to_string(),
                destination_table: "x".to_string(),
                load_type: LoadType::Full,
                watermark_column: None,
                is_active: true,
                priority: 1,
            },
        )
        .await
        .expect_err("Missing job must fail");
        assert!(matches!(err, FlowError::NotFound(_)));
    }

    // ============================================================================
    // Validation
    // ============================================================================

    fn job_row(load_type: &str, watermark_column: Option<&str>) -> TableJob {
        TableJob {
            id: 1,
            source_schema: "dbo".to_string(),
            source_table: "orders".to_string(),
            destination_schema: "stage".to_string(),
            destination_table: "orders".to_string(),
            load_type: load_type.to_string(),
            watermark_column: watermark_column.map(str::to_string),
            last_watermark_value: Some("2024-01-01".to_string()),
            is_active: true,
            priority: 1,
            created_date: 0,
            modified_date: 0,
        }
    }

    #[test]
    fn test_load_policy_valid() {
        assert_eq!(job_row("FULL", None).load_policy().unwrap(), LoadPolicy::Full);
        assert_eq!(
            job_row("incremental", Some("modified_at"))
                .load_policy()
                .unwrap(),
            LoadPolicy::Incremental {
                column: "modified_at".to_string(),
                after: Some("2024-01-01".to_string()),
            }
        );
    }

    #[test]
    fn test_load_policy_rejects_invalid_rows() {
        for job in [
            job_row("INCREMENTAL", None),
            job_row("INCREMENTAL", Some("  ")),
            job_row("FULL", Some("modified_at")),
            job_row("UPSERT", None),
            TableJob {
                destination_table: String::new(),
                ..job_row("FULL", None)
            },
        ] {
            let err = job.load_policy().expect_err("Row should be rejected");
            assert!(
                matches!(err, FlowError::Configuration(_)),
                "unexpected error: {err}"
            );
        }
    }

    #[test]
    fn test_table_ref_parse() {
        let t = TableRef::parse("dbo.orders").unwrap();
        assert_eq!(t, TableRef::new("dbo", "orders"));
        assert_eq!(t.to_string(), "dbo.orders");
        assert!(TableRef::parse("orders").is_err());
        assert!(TableRef::parse(".orders").is_err());
    }
}
