//! Migration to create the broadcasts table.
//!
//! A broadcast row holds the campaign definition, the embedded contact list
//! (JSON document, read and written as a unit by the dispatch loop), and the
//! progress checkpoint used for resume after pause or crash.

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
                    .table(Broadcasts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Broadcasts::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Broadcasts::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Broadcasts::Name).text().not_null())
                    .col(ColumnDef::new(Broadcasts::AccountId).text().not_null())
                    .col(ColumnDef::new(Broadcasts::SenderId).text().not_null())
                    .col(ColumnDef::new(Broadcasts::TemplateName).text().not_null())
                    .col(
                        ColumnDef::new(Broadcasts::TemplateLanguage)
                            .text()
                            .not_null()
                            .default("en"),
                    )
                    .col(
                        ColumnDef::new(Broadcasts::TemplateComponents)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Broadcasts::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Broadcasts::Contacts)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Broadcasts::CurrentIndex)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Broadcasts::SentCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Broadcasts::FailedCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Broadcasts::ScheduledAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Broadcasts::Timezone).text().null())
                    .col(ColumnDef::new(Broadcasts::TimeWindowStart).text().null())
                    .col(ColumnDef::new(Broadcasts::TimeWindowEnd).text().null())
                    .col(
                        ColumnDef::new(Broadcasts::EnableDeduplication)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Broadcasts::SyncIntegrationId).text().null())
                    .col(ColumnDef::new(Broadcasts::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(Broadcasts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Broadcasts::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Broadcasts::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Broadcasts::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_broadcasts_tenant_id")
                            .from(Broadcasts::Table, Broadcasts::TenantId)
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Index for the scheduler's due-scheduled and paused-resume passes
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_broadcasts_status_scheduled \
                 ON broadcasts (status, scheduled_at)"
                    .to_string(),
            ))
            .await?;

        // Index for tenant-scoped listing
        manager
            .create_index(
                Index::create()
                    .name("idx_broadcasts_tenant_created")
                    .table(Broadcasts::Table)
                    .col(Broadcasts::TenantId)
                    .col(Broadcasts::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_broadcasts_status_scheduled")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_broadcasts_tenant_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Broadcasts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Broadcasts {
    Table,
    Id,
    TenantId,
    Name,
    AccountId,
    SenderId,
    TemplateName,
    TemplateLanguage,
    TemplateComponents,
    Status,
    Contacts,
    CurrentIndex,
    SentCount,
    FailedCount,
    ScheduledAt,
    Timezone,
    TimeWindowStart,
    TimeWindowEnd,
    EnableDeduplication,
    SyncIntegrationId,
    ErrorMessage,
    CreatedAt,
    StartedAt,
    CompletedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
}
