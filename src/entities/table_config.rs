use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "table_config")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = true)]
    pub id: i64,
    pub source_schema: String,
    pub source_table: String,
    pub destination_schema: String,
    pub destination_table: String,
    pub load_type: String, // "FULL" | "INCREMENTAL"
    pub watermark_column: Option<String>,
    pub last_watermark_value: Option<String>,
    pub is_active: bool,
    pub priority: i32,
    pub created_date: i64,
    pub modified_date: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
