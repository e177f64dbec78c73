use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create master_execution_log table
        manager
            .create_table(
                Table::create()
                    .table(MasterExecutionLog::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MasterExecutionLog::RunId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(big_integer(MasterExecutionLog::StartTime))
                    .col(big_integer_null(MasterExecutionLog::EndTime))
                    .col(string(MasterExecutionLog::Status))
                    .col(big_integer(MasterExecutionLog::TableCount))
                    .col(
                        ColumnDef::new(MasterExecutionLog::SuccessfulTables)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(MasterExecutionLog::FailedTables)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(string_null(MasterExecutionLog::ErrorMessage))
                    .col(string(MasterExecutionLog::TriggeredBy))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_master_execution_log_started")
                    .table(MasterExecutionLog::Table)
                    .col(MasterExecutionLog::StartTime)
                    .to_owned(),
            )
            .await?;

        // Create execution_log table with backend-specific ID type
        let id_col = match manager.get_database_backend() {
            sea_orm::DatabaseBackend::Postgres => ColumnDef::new(ExecutionLog::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
            _ => ColumnDef::new(ExecutionLog::Id)
                .integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
        };

        manager
            .create_table(
                Table::create()
                    .table(ExecutionLog::Table)
                    .if_not_exists()
                    .col(id_col)
                    .col(string(ExecutionLog::RunId))
                    .col(string(ExecutionLog::SourceSchema))
                    .col(string(ExecutionLog::SourceTable))
                    .col(big_integer(ExecutionLog::StartTime))
                    .col(big_integer_null(ExecutionLog::EndTime))
                    .col(string(ExecutionLog::Status))
                    .col(big_integer_null(ExecutionLog::RowsCopied))
                    .col(big_integer_null(ExecutionLog::SourceRowCount))
                    .col(big_integer_null(ExecutionLog::DestinationRowCount))
                    .col(
                        ColumnDef::new(ExecutionLog::ValidationMismatch)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(string_null(ExecutionLog::WatermarkValue))
                    .col(string_null(ExecutionLog::ErrorMessage))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_execution_log_run")
                    .table(ExecutionLog::Table)
                    .col(ExecutionLog::RunId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_execution_log_started")
                    .table(ExecutionLog::Table)
                    .col(ExecutionLog::StartTime)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ExecutionLog::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(MasterExecutionLog::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum MasterExecutionLog {
    Table,
    RunId,
    StartTime,
    EndTime,
    Status,
    TableCount,
    SuccessfulTables,
    FailedTables,
    ErrorMessage,
    TriggeredBy,
}

#[derive(DeriveIden)]
enum ExecutionLog {
    Table,
    Id,
    RunId,
    SourceSchema,
    SourceTable,
    StartTime,
    EndTime,
    Status,
    RowsCopied,
    SourceRowCount,
    DestinationRowCount,
    ValidationMismatch,
    WatermarkValue,
    ErrorMessage,
}
