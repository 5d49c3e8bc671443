//! RunTask entity model
//!
//! This module contains the SeaORM entity model for the run_tasks table,
//! the durable dispatch-queue rows instructing a worker to run (or resume)
//! one broadcast's dispatch loop. Delivery is at-least-once; the worker
//! loop is idempotent over already-settled contacts.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// RunTask entity representing one queued "run this broadcast" instruction
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "run_tasks")]
pub struct Model {
    /// Unique identifier for the run task (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant identifier for multi-tenancy
    pub tenant_id: Uuid,

    /// Broadcast this task should execute
    pub broadcast_id: Uuid,

    /// Whether this task resumes a paused run (cosmetic; same loop)
    pub resume: bool,

    /// Current status of the task (queued, running, done, failed)
    pub status: String,

    /// Number of claim attempts for this task
    pub attempts: i32,

    /// Timestamp when the task becomes eligible for claiming
    pub scheduled_at: DateTimeWithTimeZone,

    /// Timestamp when a worker claimed the task
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the task finished
    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the task was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the task was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::broadcast::Entity",
        from = "Column::BroadcastId",
        to = "super::broadcast::Column::Id"
    )]
    Broadcast,
}

impl Related<super::broadcast::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Broadcast.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
