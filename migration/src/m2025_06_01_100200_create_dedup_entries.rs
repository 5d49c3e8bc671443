//! Migration to create the dedup_entries table.
//!
//! The deduplication ledger is append-only: a row for
//! (tenant, campaign name, recipient) means that campaign already reached
//! that recipient, independent of which broadcast instance sent it.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DedupEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DedupEntries::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DedupEntries::TenantId).uuid().not_null())
                    .col(ColumnDef::new(DedupEntries::CampaignName).text().not_null())
                    .col(ColumnDef::new(DedupEntries::Recipient).text().not_null())
                    .col(
                        ColumnDef::new(DedupEntries::SentAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_dedup_entries_tenant_id")
                            .from(DedupEntries::Table, DedupEntries::TenantId)
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Unique lookup index; also guards against concurrent double-append
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_dedup_entries_lookup \
                 ON dedup_entries (tenant_id, campaign_name, recipient)"
                    .to_string(),
            ))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_dedup_entries_lookup").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(DedupEntries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DedupEntries {
    Table,
    Id,
    TenantId,
    CampaignName,
    Recipient,
    SentAt,
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
}
