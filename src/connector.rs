//! Generic SQL source/destination over a SeaORM connection.
//!
//! Statements are built with sea-query so identifiers are quoted for the
//! connected backend. SQLite has no schemas, so tables are addressed by name
//! alone there.

use crate::copy::{DestinationWriter, Page, Row, SourceReader, WatermarkFilter};
use crate::errors::FlowError;
use crate::registry::TableRef;
use async_trait::async_trait;
use sea_orm::sea_query::{
    Alias, Asterisk, Expr, Func, IntoTableRef, Keyword, Order, Query, SelectStatement, SimpleExpr,
    TableRef as SqlTableRef,
};
use sea_orm::{
    ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr, FromQueryResult,
    JsonValue, Statement,
};
use serde_json::Value;
use tracing::debug;

const ROW_COUNT: &str = "row_count";

/// Bind parameters allowed in one statement
const SQLITE_MAX_PARAMS: usize = 32766;
const POSTGRES_MAX_PARAMS: usize = 65535;

#[derive(Clone)]
pub struct SqlConnector {
    db: DatabaseConnection,
}

impl SqlConnector {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn connect(url: &str) -> Result<Self, FlowError> {
        let db = Database::connect(url)
            .await
            .map_err(|e| FlowError::Connectivity(format!("cannot connect to {}: {}", url, e)))?;
        Ok(Self::new(db))
    }

    fn backend(&self) -> DatabaseBackend {
        self.db.get_database_backend()
    }

    fn table_ref(&self, table: &TableRef) -> SqlTableRef {
        match self.backend() {
            DatabaseBackend::Sqlite => Alias::new(&table.name).into_table_ref(),
            _ => (Alias::new(&table.schema), Alias::new(&table.name)).into_table_ref(),
        }
    }

    fn max_rows_per_insert(&self, columns: usize) -> usize {
        let max_params = match self.backend() {
            DatabaseBackend::Sqlite => SQLITE_MAX_PARAMS,
            _ => POSTGRES_MAX_PARAMS,
        };
        (max_params / columns.max(1)).max(1)
    }

    /// Declared type of `column`, used to cast watermark literals on Postgres
    async fn column_type(&self, table: &TableRef, column: &str) -> Result<String, FlowError> {
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT format_type(a.atttypid, a.atttypmod) AS column_type \
             FROM pg_attribute a \
             WHERE a.attrelid = to_regclass(quote_ident($1) || '.' || quote_ident($2)) \
             AND a.attname = $3 AND a.attnum > 0 AND NOT a.attisdropped",
            [
                table.schema.clone().into(),
                table.name.clone().into(),
                column.to_string().into(),
            ],
        );
        let row = self
            .db
            .query_one(stmt)
            .await
            .map_err(|e| transfer_error(table, e))?
            .ok_or_else(|| {
                FlowError::Configuration(format!(
                    "watermark column `{}` does not exist on {}",
                    column, table
                ))
            })?;
        row.try_get("", "column_type")
            .map_err(|e| transfer_error(table, e))
    }

    async fn filter_condition(
        &self,
        table: &TableRef,
        filter: &WatermarkFilter,
    ) -> Result<SimpleExpr, FlowError> {
        let column_type = match self.backend() {
            DatabaseBackend::Postgres => Some(self.column_type(table, &filter.column).await?),
            _ => None,
        };
        Ok(watermark_condition(filter, column_type.as_deref()))
    }

    async fn count(
        &self,
        table: &TableRef,
        filter: Option<&WatermarkFilter>,
    ) -> Result<u64, FlowError> {
        let mut select = Query::select();
        select
            .expr_as(Func::count(Expr::col(Asterisk)), Alias::new(ROW_COUNT))
            .from(self.table_ref(table));
        if let Some(f) = filter {
            select.and_where(self.filter_condition(table, f).await?);
        }

        let stmt = self.backend().build(&select);
        let row = self
            .db
            .query_one(stmt)
            .await
            .map_err(|e| transfer_error(table, e))?
            .ok_or_else(|| FlowError::DataTransfer(format!("count of {} returned no row", table)))?;
        let count: i64 = row
            .try_get("", ROW_COUNT)
            .map_err(|e| transfer_error(table, e))?;
        Ok(count.max(0) as u64)
    }

    /// Tie-break on physical row order so offset pages do not overlap
    fn order_by_row_position(&self, select: &mut SelectStatement) {
        let position = match self.backend() {
            DatabaseBackend::Sqlite => "rowid",
            _ => "ctid",
        };
        select.order_by_expr(Expr::cust(position), Order::Asc);
    }
}

/// `column > after`, with `after` cast to the column's type when it is known.
///
/// Without a cast Postgres would compare e.g. `bigint > text` and reject the
/// query; SQLite applies column affinity to the text literal itself.
fn watermark_condition(filter: &WatermarkFilter, column_type: Option<&str>) -> SimpleExpr {
    let column = Expr::col(Alias::new(&filter.column));
    match column_type {
        Some(ty) => column.gt(Expr::cust_with_values(
            format!("CAST(? AS {})", ty),
            [filter.after.clone()],
        )),
        None => column.gt(filter.after.clone()),
    }
}

fn transfer_error(table: &TableRef, e: DbErr) -> FlowError {
    match e {
        DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => {
            FlowError::Connectivity(format!("{}: {}", table, e))
        }
        other => FlowError::DataTransfer(format!("{}: {}", table, other)),
    }
}

fn json_to_sql(value: Option<&Value>) -> SimpleExpr {
    match value {
        None | Some(Value::Null) => SimpleExpr::Keyword(Keyword::Null),
        Some(Value::Bool(b)) => Expr::value(*b),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Expr::value(i)
            } else if let Some(u) = n.as_u64() {
                Expr::value(u)
            } else {
                Expr::value(n.as_f64().unwrap_or_default())
            }
        }
        Some(Value::String(s)) => Expr::value(s.clone()),
        Some(other) => Expr::value(other.to_string()),
    }
}

#[async_trait]
impl SourceReader for SqlConnector {
    async fn read_rows(&self, table: &TableRef, page: Page<'_>) -> Result<Vec<Row>, FlowError> {
        let mut select = Query::select();
        select.column(Asterisk).from(self.table_ref(table));
        if let Some(f) = page.filter {
            select.and_where(self.filter_condition(table, f).await?);
        }
        if let Some(column) = page.order_by {
            select.order_by(Alias::new(column), Order::Asc);
        }
        self.order_by_row_position(&mut select);
        select.limit(page.limit).offset(page.offset);

        let stmt = self.backend().build(&select);
        debug!(%table, sql = %stmt.sql, offset = page.offset, "Reading source rows");
        let values = JsonValue::find_by_statement(stmt)
            .all(&self.db)
            .await
            .map_err(|e| transfer_error(table, e))?;

        values
            .into_iter()
            .map(|value| match value {
                Value::Object(row) => Ok(row),
                other => Err(FlowError::DataTransfer(format!(
                    "unexpected row shape from {}: {}",
                    table, other
                ))),
            })
            .collect()
    }

    async fn count_rows(
        &self,
        table: &TableRef,
        filter: Option<&WatermarkFilter>,
    ) -> Result<u64, FlowError> {
        self.count(table, filter).await
    }
}

#[async_trait]
impl DestinationWriter for SqlConnector {
    async fn truncate(&self, table: &TableRef) -> Result<(), FlowError> {
        let delete = Query::delete().from_table(self.table_ref(table)).to_owned();
        self.db
            .execute(self.backend().build(&delete))
            .await
            .map_err(|e| transfer_error(table, e))?;
        Ok(())
    }

    async fn append_rows(&self, table: &TableRef, rows: &[Row]) -> Result<u64, FlowError> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        let columns: Vec<&String> = first.keys().collect();

        let mut written = 0;
        for chunk in rows.chunks(self.max_rows_per_insert(columns.len())) {
            let mut insert = Query::insert();
            insert
                .into_table(self.table_ref(table))
                .columns(columns.iter().map(|c| Alias::new(c.as_str())));
            for row in chunk {
                let values: Vec<SimpleExpr> = columns
                    .iter()
                    .map(|c| json_to_sql(row.get(c.as_str())))
                    .collect();
                insert
                    .values(values)
                    .map_err(|e| FlowError::DataTransfer(format!("{}: {}", table, e)))?;
            }

            let result = self
                .db
                .execute(self.backend().build(&insert))
                .await
                .map_err(|e| transfer_error(table, e))?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn count_rows(&self, table: &TableRef) -> Result<u64, FlowError> {
        self.count(table, None).await
    }
}
