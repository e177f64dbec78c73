use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "execution_log")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = true)]
    pub id: i64,
    pub run_id: String,
    pub source_schema: String,
    pub source_table: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: String, // "RUNNING" | "SUCCEEDED" | "FAILED"
    pub rows_copied: Option<i64>,
    pub source_row_count: Option<i64>,
    pub destination_row_count: Option<i64>,
    pub validation_mismatch: bool,
    pub watermark_value: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
