use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "master_execution_log")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub run_id: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: String,
    pub table_count: i64,
    pub successful_tables: i64,
    pub failed_tables: i64,
    pub error_message: Option<String>,
    pub triggered_by: String, // "cli" | "schedule" | "admin"
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
