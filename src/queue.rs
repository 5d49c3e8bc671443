//! # Dispatch Queue
//!
//! Durable at-least-once queue of "run this broadcast" tasks. The scheduler
//! and the lifecycle handlers enqueue; the dispatcher claims batches with a
//! single guarded UPDATE so two dispatcher instances never run the same
//! task. A crash after claim leaves the task `running` forever only until
//! the broadcast is re-enqueued; the worker loop is idempotent over
//! already-settled contacts, so replays are safe.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, QueryTrait, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::run_task::{ActiveModel, Column, Entity};

/// A claimed unit of work: run (or resume) one broadcast's dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub broadcast_id: Uuid,
    pub resume: bool,
    pub attempts: i32,
}

/// Queue abstraction so the dispatcher and scheduler can be exercised
/// against an in-memory double.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a run task for the broadcast, eligible immediately.
    async fn enqueue(
        &self,
        tenant_id: Uuid,
        broadcast_id: Uuid,
        resume: bool,
    ) -> Result<RunTask, ApiError>;

    /// Whether a queued or running task already exists for the broadcast.
    async fn has_active(&self, broadcast_id: Uuid) -> Result<bool, ApiError>;

    /// Whether an unclaimed task already exists for the broadcast. A task
    /// that is merely `running` does not count: its worker may have already
    /// stopped, so callers re-arming a broadcast still need to enqueue and
    /// let `claim`'s single-flight guard serialize against it.
    async fn has_queued(&self, broadcast_id: Uuid) -> Result<bool, ApiError>;

    /// Atomically claim up to `limit` due tasks.
    async fn claim(&self, limit: usize) -> Result<Vec<RunTask>, ApiError>;

    /// Mark a claimed task finished.
    async fn complete(&self, task_id: Uuid, success: bool) -> Result<(), ApiError>;
}

/// Database-backed queue over the run_tasks table.
#[derive(Clone)]
pub struct DbTaskQueue {
    db: DatabaseConnection,
}

impl DbTaskQueue {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TaskQueue for DbTaskQueue {
    async fn enqueue(
        &self,
        tenant_id: Uuid,
        broadcast_id: Uuid,
        resume: bool,
    ) -> Result<RunTask, ApiError> {
        let now = Utc::now().fixed_offset();

        let task = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            broadcast_id: Set(broadcast_id),
            resume: Set(resume),
            status: Set("queued".to_string()),
            attempts: Set(0),
            scheduled_at: Set(now),
            started_at: Set(None),
            finished_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let inserted = task.insert(&self.db).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            broadcast_id = %broadcast_id,
            task_id = %inserted.id,
            resume,
            "Run task enqueued"
        );

        Ok(RunTask {
            id: inserted.id,
            tenant_id: inserted.tenant_id,
            broadcast_id: inserted.broadcast_id,
            resume: inserted.resume,
            attempts: inserted.attempts,
        })
    }

    async fn has_active(&self, broadcast_id: Uuid) -> Result<bool, ApiError> {
        let count = Entity::find()
            .filter(Column::BroadcastId.eq(broadcast_id))
            .filter(Column::Status.is_in(["queued", "running"]))
            .count(&self.db)
            .await?;

        Ok(count > 0)
    }

    async fn has_queued(&self, broadcast_id: Uuid) -> Result<bool, ApiError> {
        let count = Entity::find()
            .filter(Column::BroadcastId.eq(broadcast_id))
            .filter(Column::Status.eq("queued"))
            .count(&self.db)
            .await?;

        Ok(count > 0)
    }

    async fn claim(&self, limit: usize) -> Result<Vec<RunTask>, ApiError> {
        let now = Utc::now();
        let now_db = now.fixed_offset();
        let txn = self.db.begin().await?;

        // Select eligible ids, excluding broadcasts that already have a
        // running task (single-flight per broadcast).
        let eligible: Vec<Uuid> = Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Status.eq("queued"))
            .filter(Column::ScheduledAt.lte(now))
            .filter(
                Column::BroadcastId.not_in_subquery(
                    Entity::find()
                        .select_only()
                        .column(Column::BroadcastId)
                        .filter(Column::Status.eq("running"))
                        .into_query(),
                ),
            )
            .order_by_asc(Column::ScheduledAt)
            .limit(Some(limit as u64))
            .into_tuple()
            .all(&txn)
            .await?;

        if eligible.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }

        // Claim them in a single guarded UPDATE
        let update_result = Entity::update_many()
            .col_expr(Column::Status, Expr::value("running"))
            .col_expr(Column::StartedAt, Expr::value(now_db))
            .col_expr(Column::UpdatedAt, Expr::value(now_db))
            .col_expr(
                Column::Attempts,
                Expr::value(Expr::col(Column::Attempts).add(1)),
            )
            .filter(Column::Id.is_in(eligible.clone()))
            .filter(Column::Status.eq("queued"))
            .exec(&txn)
            .await?;

        // Fetch by the selected ids; another claimer's rows must never
        // leak into this batch.
        let claimed = if update_result.rows_affected > 0 {
            Entity::find()
                .filter(Column::Id.is_in(eligible))
                .filter(Column::Status.eq("running"))
                .all(&txn)
                .await?
        } else {
            Vec::new()
        };

        txn.commit().await?;

        Ok(claimed
            .into_iter()
            .map(|model| RunTask {
                id: model.id,
                tenant_id: model.tenant_id,
                broadcast_id: model.broadcast_id,
                resume: model.resume,
                attempts: model.attempts,
            })
            .collect())
    }

    async fn complete(&self, task_id: Uuid, success: bool) -> Result<(), ApiError> {
        let now = Utc::now().fixed_offset();
        let status = if success { "done" } else { "failed" };

        Entity::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(task_id))
            .filter(Column::Status.eq("running"))
            .exec(&self.db)
            .await?;

        Ok(())
    }
}

/// In-memory queue double used by engine tests.
#[derive(Default)]
pub struct InMemoryTaskQueue {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    queued: VecDeque<RunTask>,
    running: Vec<RunTask>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks still queued (not yet claimed).
    pub fn queued_len(&self) -> usize {
        self.inner.lock().expect("queue lock").queued.len()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(
        &self,
        tenant_id: Uuid,
        broadcast_id: Uuid,
        resume: bool,
    ) -> Result<RunTask, ApiError> {
        let task = RunTask {
            id: Uuid::new_v4(),
            tenant_id,
            broadcast_id,
            resume,
            attempts: 0,
        };
        self.inner
            .lock()
            .expect("queue lock")
            .queued
            .push_back(task.clone());
        Ok(task)
    }

    async fn has_active(&self, broadcast_id: Uuid) -> Result<bool, ApiError> {
        let state = self.inner.lock().expect("queue lock");
        Ok(state
            .queued
            .iter()
            .chain(state.running.iter())
            .any(|task| task.broadcast_id == broadcast_id))
    }

    async fn has_queued(&self, broadcast_id: Uuid) -> Result<bool, ApiError> {
        let state = self.inner.lock().expect("queue lock");
        Ok(state
            .queued
            .iter()
            .any(|task| task.broadcast_id == broadcast_id))
    }

    async fn claim(&self, limit: usize) -> Result<Vec<RunTask>, ApiError> {
        let mut state = self.inner.lock().expect("queue lock");
        let mut claimed = Vec::new();
        while claimed.len() < limit {
            let Some(mut task) = state.queued.pop_front() else {
                break;
            };
            task.attempts += 1;
            state.running.push(task.clone());
            claimed.push(task);
        }
        Ok(claimed)
    }

    async fn complete(&self, task_id: Uuid, _success: bool) -> Result<(), ApiError> {
        let mut state = self.inner.lock().expect("queue lock");
        state.running.retain(|task| task.id != task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{ConnectionTrait, Database, Statement};

    async fn setup() -> (DatabaseConnection, Uuid, Uuid) {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("create in-memory db");
        Migrator::up(&db, None).await.expect("apply migrations");

        let backend = db.get_database_backend();
        let tenant_id = Uuid::new_v4();
        db.execute(Statement::from_sql_and_values(
            backend,
            "INSERT INTO tenants (id, name) VALUES (?, ?)",
            vec![tenant_id.into(), "Test Tenant".into()],
        ))
        .await
        .expect("insert tenant");

        let broadcast_id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        db.execute(Statement::from_sql_and_values(
            backend,
            "INSERT INTO broadcasts (id, tenant_id, name, account_id, sender_id, template_name, contacts, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            vec![
                broadcast_id.into(),
                tenant_id.into(),
                "Promo".into(),
                "acct".into(),
                "sender".into(),
                "welcome".into(),
                "[]".into(),
                now.clone().into(),
                now.into(),
            ],
        ))
        .await
        .expect("insert broadcast");

        (db, tenant_id, broadcast_id)
    }

    #[tokio::test]
    async fn enqueue_claim_complete_round_trip() {
        let (db, tenant_id, broadcast_id) = setup().await;
        let queue = DbTaskQueue::new(db);

        let task = queue
            .enqueue(tenant_id, broadcast_id, false)
            .await
            .expect("enqueue");
        assert!(queue.has_active(broadcast_id).await.expect("has_active"));

        let claimed = queue.claim(10).await.expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, task.id);
        assert_eq!(claimed[0].attempts, 1);

        // Claimed but not completed: active for the scheduler, but no
        // longer blocking a re-arm enqueue
        assert!(queue.has_active(broadcast_id).await.expect("has_active"));
        assert!(!queue.has_queued(broadcast_id).await.expect("has_queued"));

        // Claimed task stays single-flight
        let claimed_again = queue.claim(10).await.expect("claim");
        assert!(claimed_again.is_empty());

        queue.complete(task.id, true).await.expect("complete");
        assert!(!queue.has_active(broadcast_id).await.expect("has_active"));
    }

    #[tokio::test]
    async fn claim_excludes_broadcasts_with_running_task() {
        let (db, tenant_id, broadcast_id) = setup().await;
        let queue = DbTaskQueue::new(db);

        queue
            .enqueue(tenant_id, broadcast_id, false)
            .await
            .expect("enqueue first");
        let first = queue.claim(10).await.expect("claim");
        assert_eq!(first.len(), 1);

        // A second task for the same broadcast must wait for the first
        queue
            .enqueue(tenant_id, broadcast_id, true)
            .await
            .expect("enqueue second");
        let blocked = queue.claim(10).await.expect("claim");
        assert!(blocked.is_empty(), "same-broadcast task not claimable");

        queue.complete(first[0].id, true).await.expect("complete");
        let unblocked = queue.claim(10).await.expect("claim");
        assert_eq!(unblocked.len(), 1);
        assert!(unblocked[0].resume);
    }

    #[tokio::test]
    async fn in_memory_queue_matches_contract() {
        let queue = InMemoryTaskQueue::new();
        let tenant_id = Uuid::new_v4();
        let broadcast_id = Uuid::new_v4();

        let task = queue
            .enqueue(tenant_id, broadcast_id, false)
            .await
            .expect("enqueue");
        assert!(queue.has_active(broadcast_id).await.expect("has_active"));
        assert_eq!(queue.queued_len(), 1);

        let claimed = queue.claim(5).await.expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(queue.queued_len(), 0);
        assert!(queue.has_active(broadcast_id).await.expect("has_active"));
        assert!(!queue.has_queued(broadcast_id).await.expect("has_queued"));

        queue.complete(task.id, true).await.expect("complete");
        assert!(!queue.has_active(broadcast_id).await.expect("has_active"));
    }
}
