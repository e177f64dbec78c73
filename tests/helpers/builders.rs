use sea_orm::DatabaseConnection;
use tableflow::registry::{self, LoadType, NewTableJob, TableJob};

/// Builder for registering test tables
pub struct TableJobBuilder {
    source_schema: String,
    source_table: String,
    destination_schema: String,
    destination_table: String,
    load_type: LoadType,
    watermark_column: Option<String>,
    last_watermark_value: Option<String>,
    is_active: bool,
    priority: i32,
}

impl TableJobBuilder {
    /// FULL load of `schema.table` into `stage.table`
    pub fn full(schema: &str, table: &str) -> Self {
        Self {
            source_schema: schema.to_string(),
            source_table: table.to_string(),
            destination_schema: "stage".to_string(),
            destination_table: table.to_string(),
            load_type: LoadType::Full,
            watermark_column: None,
            last_watermark_value: None,
            is_active: true,
            priority: 100,
        }
    }

    /// INCREMENTAL load on `modified_at`
    pub fn incremental(schema: &str, table: &str) -> Self {
        Self {
            load_type: LoadType::Incremental,
            watermark_column: Some("modified_at".to_string()),
            ..Self::full(schema, table)
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn watermark(mut self, value: &str) -> Self {
        self.last_watermark_value = Some(value.to_string());
        self
    }

    pub fn without_watermark_column(mut self) -> Self {
        self.watermark_column = None;
        self
    }

    pub fn destination(mut self, schema: &str, table: &str) -> Self {
        self.destination_schema = schema.to_string();
        self.destination_table = table.to_string();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> TableJob {
        registry::insert_table_job(
            db,
            NewTableJob {
                source_schema: self.source_schema,
                source_table: self.source_table,
                destination_schema: self.destination_schema,
                destination_table: self.destination_table,
                load_type: self.load_type,
                watermark_column: self.watermark_column,
                last_watermark_value: self.last_watermark_value,
                is_active: self.is_active,
                priority: self.priority,
            },
        )
        .await
        .expect("Failed to register test table")
    }
}
