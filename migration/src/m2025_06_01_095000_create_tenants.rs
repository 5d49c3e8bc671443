//! Tenants table. Broadcasts, run tasks, and dedup entries all hang off
//! a tenant row, so this migration runs first.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let table = Table::create()
            .table(Tenants::Table)
            .if_not_exists()
            .col(ColumnDef::new(Tenants::Id).uuid().not_null().primary_key())
            .col(ColumnDef::new(Tenants::Name).text())
            .col(
                ColumnDef::new(Tenants::CreatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .to_owned();

        manager.create_table(table).await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Tenants::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
    Name,
    CreatedAt,
}
