pub mod execution_log;
pub mod master_execution_log;
pub mod table_config;

pub use execution_log::Entity as ExecutionLog;
pub use master_execution_log::Entity as MasterExecutionLog;
pub use table_config::Entity as TableConfig;
