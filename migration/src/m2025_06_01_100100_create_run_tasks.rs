//! Migration to create the run_tasks table.
//!
//! Run tasks are the durable dispatch-queue rows instructing a worker to
//! execute (or resume) one broadcast's dispatch loop. Delivery is
//! at-least-once; consumers claim rows with a guarded status update.

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
                    .table(RunTasks::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(RunTasks::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(RunTasks::TenantId).uuid().not_null())
                    .col(ColumnDef::new(RunTasks::BroadcastId).uuid().not_null())
                    .col(
                        ColumnDef::new(RunTasks::Resume)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(RunTasks::Status)
                            .text()
                            .not_null()
                            .default("queued"),
                    )
                    .col(
                        ColumnDef::new(RunTasks::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RunTasks::ScheduledAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RunTasks::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RunTasks::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RunTasks::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RunTasks::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_run_tasks_tenant_id")
                            .from(RunTasks::Table, RunTasks::TenantId)
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_run_tasks_broadcast_id")
                            .from(RunTasks::Table, RunTasks::BroadcastId)
                            .to(Broadcasts::Table, Broadcasts::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Index for claiming the next ready task
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_run_tasks_status_scheduled \
                 ON run_tasks (status, scheduled_at)"
                    .to_string(),
            ))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_run_tasks_status_scheduled")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(RunTasks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RunTasks {
    Table,
    Id,
    TenantId,
    BroadcastId,
    Resume,
    Status,
    Attempts,
    ScheduledAt,
    StartedAt,
    FinishedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum Broadcasts {
    Table,
    Id,
}
