use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Backend-specific ID type, SQLite only auto-increments INTEGER keys
        let id_col = match manager.get_database_backend() {
            sea_orm::DatabaseBackend::Postgres => ColumnDef::new(TableConfig::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
            _ => ColumnDef::new(TableConfig::Id)
                .integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
        };

        manager
            .create_table(
                Table::create()
                    .table(TableConfig::Table)
                    .if_not_exists()
                    .col(id_col)
                    .col(string(TableConfig::SourceSchema))
                    .col(string(TableConfig::SourceTable))
                    .col(string(TableConfig::DestinationSchema))
                    .col(string(TableConfig::DestinationTable))
                    .col(
                        ColumnDef::new(TableConfig::LoadType)
                            .string()
                            .not_null()
                            .default("FULL"),
                    )
                    .col(string_null(TableConfig::WatermarkColumn))
                    .col(string_null(TableConfig::LastWatermarkValue))
                    .col(
                        ColumnDef::new(TableConfig::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(TableConfig::Priority)
                            .integer()
                            .not_null()
                            .default(100),
                    )
                    .col(big_integer(TableConfig::CreatedDate))
                    .col(big_integer(TableConfig::ModifiedDate))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("ux_table_config_source")
                    .table(TableConfig::Table)
                    .col(TableConfig::SourceSchema)
                    .col(TableConfig::SourceTable)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Run snapshots filter on is_active and sort on priority
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_table_config_active_priority")
                    .table(TableConfig::Table)
                    .col(TableConfig::IsActive)
                    .col(TableConfig::Priority)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TableConfig::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TableConfig {
    Table,
    Id,
    SourceSchema,
    SourceTable,
    DestinationSchema,
    DestinationTable,
    LoadType,
    WatermarkColumn,
    LastWatermarkValue,
    IsActive,
    Priority,
    CreatedDate,
    ModifiedDate,
}
