//! # Broadcast Repository
//!
//! Repository operations for the broadcasts table. All lifecycle status
//! changes go through guarded compare-and-swap updates: the UPDATE filters
//! on the expected current status and the caller inspects `rows_affected`,
//! so a concurrent cancel or pause always wins over a stale writer.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::broadcast::{ActiveModel, BroadcastStatus, Column, Entity, Model};
use crate::models::contact::{Contact, ContactStatus, count_with_status};

/// Fields required to create a new broadcast row.
#[derive(Debug, Clone)]
pub struct NewBroadcast {
    pub name: String,
    pub account_id: String,
    pub sender_id: String,
    pub template_name: String,
    pub template_language: String,
    pub template_components: Option<JsonValue>,
    pub contacts: Vec<Contact>,
    pub timezone: Option<String>,
    pub time_window_start: Option<String>,
    pub time_window_end: Option<String>,
    pub enable_deduplication: bool,
    pub sync_integration_id: Option<String>,
}

/// Repository for broadcast database operations
#[derive(Clone)]
pub struct BroadcastRepository {
    db: DatabaseConnection,
}

impl BroadcastRepository {
    /// Create a new BroadcastRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert a new broadcast in `pending` status.
    pub async fn create(&self, tenant_id: Uuid, input: NewBroadcast) -> Result<Model, ApiError> {
        let now = Utc::now().fixed_offset();
        let contacts = serde_json::to_value(&input.contacts).map_err(|e| {
            tracing::error!("Failed to serialize contact list: {}", e);
            ApiError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
                "Failed to serialize contact list",
            )
        })?;

        let broadcast = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            name: Set(input.name),
            account_id: Set(input.account_id),
            sender_id: Set(input.sender_id),
            template_name: Set(input.template_name),
            template_language: Set(input.template_language),
            template_components: Set(input.template_components),
            status: Set(BroadcastStatus::Pending.as_str().to_string()),
            contacts: Set(contacts),
            current_index: Set(0),
            sent_count: Set(0),
            failed_count: Set(0),
            scheduled_at: Set(None),
            timezone: Set(input.timezone),
            time_window_start: Set(input.time_window_start),
            time_window_end: Set(input.time_window_end),
            enable_deduplication: Set(input.enable_deduplication),
            sync_integration_id: Set(input.sync_integration_id),
            error_message: Set(None),
            created_at: Set(now),
            started_at: Set(None),
            completed_at: Set(None),
            updated_at: Set(now),
        };

        let result = broadcast.insert(&self.db).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            broadcast_id = %result.id,
            contacts = result.contacts.as_array().map(|a| a.len()).unwrap_or(0),
            "Broadcast created"
        );

        Ok(result)
    }

    /// Find a broadcast by ID, ensuring it belongs to the specified tenant
    pub async fn find_by_tenant(
        &self,
        tenant_id: Uuid,
        broadcast_id: Uuid,
    ) -> Result<Option<Model>, ApiError> {
        let broadcast = Entity::find_by_id(broadcast_id)
            .filter(Column::TenantId.eq(tenant_id))
            .one(&self.db)
            .await?;

        Ok(broadcast)
    }

    /// Load a broadcast without tenant scoping (worker-internal use).
    pub async fn find_by_id(&self, broadcast_id: Uuid) -> Result<Option<Model>, ApiError> {
        Ok(Entity::find_by_id(broadcast_id).one(&self.db).await?)
    }

    /// List broadcasts for a tenant, newest first, with optional status filter
    pub async fn list_by_tenant(
        &self,
        tenant_id: Uuid,
        status: Option<String>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Model>, ApiError> {
        let mut query = Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .order_by_desc(Column::CreatedAt);

        if let Some(status_filter) = status {
            query = query.filter(Column::Status.eq(status_filter));
        }

        let results = if let Some(limit_value) = limit {
            query
                .offset(offset.unwrap_or(0))
                .limit(limit_value)
                .all(&self.db)
                .await
        } else {
            query.all(&self.db).await
        }?;

        Ok(results)
    }

    /// Fresh read of just the lifecycle status. The worker re-reads this
    /// before every contact so cancels and pauses take effect mid-run.
    pub async fn current_status(
        &self,
        broadcast_id: Uuid,
    ) -> Result<Option<BroadcastStatus>, ApiError> {
        let status: Option<String> = Entity::find_by_id(broadcast_id)
            .select_only()
            .column(Column::Status)
            .into_tuple()
            .one(&self.db)
            .await?;

        Ok(status.as_deref().and_then(BroadcastStatus::parse))
    }

    /// Guarded status transition: succeeds only when the row is currently in
    /// one of `from`. Returns whether the transition won.
    pub async fn transition(
        &self,
        broadcast_id: Uuid,
        from: &[BroadcastStatus],
        to: BroadcastStatus,
    ) -> Result<bool, ApiError> {
        let now = Utc::now().fixed_offset();
        let from_labels: Vec<&str> = from.iter().map(BroadcastStatus::as_str).collect();

        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(to.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(now));

        match to {
            BroadcastStatus::Processing => {
                // First start stamps started_at; a resume keeps the original.
                update = update.col_expr(
                    Column::StartedAt,
                    Expr::col(Column::StartedAt).if_null(Expr::value(now)),
                );
            }
            BroadcastStatus::Completed => {
                update = update.col_expr(Column::CompletedAt, Expr::value(now));
            }
            _ => {}
        }

        let result = update
            .filter(Column::Id.eq(broadcast_id))
            .filter(Column::Status.is_in(from_labels))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Move a pending broadcast to `scheduled` with the given fire time,
    /// optionally replacing the delivery-window fields.
    pub async fn schedule(
        &self,
        tenant_id: Uuid,
        broadcast_id: Uuid,
        scheduled_at: DateTime<Utc>,
        timezone: Option<String>,
        time_window_start: Option<String>,
        time_window_end: Option<String>,
    ) -> Result<bool, ApiError> {
        let now = Utc::now().fixed_offset();

        let mut update = Entity::update_many()
            .col_expr(
                Column::Status,
                Expr::value(BroadcastStatus::Scheduled.as_str()),
            )
            .col_expr(Column::ScheduledAt, Expr::value(scheduled_at.fixed_offset()))
            .col_expr(Column::UpdatedAt, Expr::value(now));

        if timezone.is_some() {
            update = update.col_expr(Column::Timezone, Expr::value(timezone));
        }
        if time_window_start.is_some() {
            update = update.col_expr(Column::TimeWindowStart, Expr::value(time_window_start));
        }
        if time_window_end.is_some() {
            update = update.col_expr(Column::TimeWindowEnd, Expr::value(time_window_end));
        }

        let result = update
            .filter(Column::Id.eq(broadcast_id))
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::Status.eq(BroadcastStatus::Pending.as_str()))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Record a fatal error and move the broadcast to `failed`.
    pub async fn mark_failed(
        &self,
        broadcast_id: Uuid,
        error_message: &str,
    ) -> Result<bool, ApiError> {
        let now = Utc::now().fixed_offset();
        let terminal: Vec<&str> = [
            BroadcastStatus::Completed,
            BroadcastStatus::Failed,
            BroadcastStatus::Cancelled,
        ]
        .iter()
        .map(BroadcastStatus::as_str)
        .collect();

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(BroadcastStatus::Failed.as_str()))
            .col_expr(Column::ErrorMessage, Expr::value(Some(error_message)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(broadcast_id))
            .filter(Column::Status.is_not_in(terminal))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Persist the worker's progress checkpoint: the updated contact list
    /// document, the resume position, and the running counters.
    pub async fn write_checkpoint(
        &self,
        broadcast_id: Uuid,
        contacts: &[Contact],
        current_index: i32,
        sent_count: i32,
        failed_count: i32,
    ) -> Result<(), ApiError> {
        let now = Utc::now().fixed_offset();
        let contacts_json = serde_json::to_value(contacts).map_err(|e| {
            tracing::error!("Failed to serialize checkpoint contacts: {}", e);
            ApiError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
                "Failed to serialize checkpoint",
            )
        })?;

        Entity::update_many()
            .col_expr(Column::Contacts, Expr::value(contacts_json))
            .col_expr(Column::CurrentIndex, Expr::value(current_index))
            .col_expr(Column::SentCount, Expr::value(sent_count))
            .col_expr(Column::FailedCount, Expr::value(failed_count))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(broadcast_id))
            .exec(&self.db)
            .await?;

        Ok(())
    }

    /// Reopen a completed or failed broadcast for a retry cycle: every
    /// failed contact goes back to pending with its resend-cycle counter
    /// bumped, the resume position moves to the first pending contact, and
    /// the broadcast returns to `processing`. Returns the number of
    /// contacts reset, or None when the broadcast was not retryable.
    pub async fn reopen_for_retry(
        &self,
        tenant_id: Uuid,
        broadcast_id: Uuid,
    ) -> Result<Option<usize>, ApiError> {
        let Some(broadcast) = self.find_by_tenant(tenant_id, broadcast_id).await? else {
            return Ok(None);
        };

        let status = BroadcastStatus::parse(&broadcast.status);
        if !matches!(
            status,
            Some(BroadcastStatus::Completed) | Some(BroadcastStatus::Failed)
        ) {
            return Ok(None);
        }

        let mut contacts: Vec<Contact> =
            serde_json::from_value(broadcast.contacts.clone()).unwrap_or_default();

        let mut reset = 0usize;
        for contact in contacts.iter_mut() {
            if contact.status == ContactStatus::Failed {
                contact.status = ContactStatus::Pending;
                contact.error = None;
                contact.retry_attempts += 1;
                reset += 1;
            }
        }

        if reset == 0 {
            return Ok(Some(0));
        }

        let first_pending = contacts
            .iter()
            .position(|c| c.status == ContactStatus::Pending)
            .unwrap_or(0) as i32;

        let contacts_json = serde_json::to_value(&contacts).map_err(|e| {
            tracing::error!("Failed to serialize retried contacts: {}", e);
            ApiError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
                "Failed to serialize contact list",
            )
        })?;
        let now = Utc::now().fixed_offset();

        let result = Entity::update_many()
            .col_expr(Column::Contacts, Expr::value(contacts_json))
            .col_expr(Column::CurrentIndex, Expr::value(first_pending))
            .col_expr(
                Column::FailedCount,
                Expr::value(count_with_status(&contacts, ContactStatus::Failed)),
            )
            .col_expr(
                Column::Status,
                Expr::value(BroadcastStatus::Processing.as_str()),
            )
            .col_expr(Column::ErrorMessage, Expr::value(Option::<String>::None))
            .col_expr(Column::CompletedAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(broadcast_id))
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::Status.is_in([
                BroadcastStatus::Completed.as_str(),
                BroadcastStatus::Failed.as_str(),
            ]))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            // Lost a race with another transition
            return Ok(None);
        }

        tracing::info!(
            tenant_id = %tenant_id,
            broadcast_id = %broadcast_id,
            reset,
            "Broadcast reopened for retry"
        );

        Ok(Some(reset))
    }

    /// Delete a broadcast unless it is currently processing.
    /// Returns false when the row does not exist for this tenant.
    pub async fn delete(&self, tenant_id: Uuid, broadcast_id: Uuid) -> Result<bool, ApiError> {
        let result = Entity::delete_many()
            .filter(Column::Id.eq(broadcast_id))
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::Status.ne(BroadcastStatus::Processing.as_str()))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Scheduled broadcasts whose fire time has passed.
    pub async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Model>, ApiError> {
        let results = Entity::find()
            .filter(Column::Status.eq(BroadcastStatus::Scheduled.as_str()))
            .filter(Column::ScheduledAt.lte(now))
            .order_by_asc(Column::ScheduledAt)
            .limit(limit)
            .all(&self.db)
            .await?;

        Ok(results)
    }

    /// All paused broadcasts (scheduler resume-pass candidates).
    pub async fn paused(&self, limit: u64) -> Result<Vec<Model>, ApiError> {
        let results = Entity::find()
            .filter(Column::Status.eq(BroadcastStatus::Paused.as_str()))
            .order_by_asc(Column::UpdatedAt)
            .limit(limit)
            .all(&self.db)
            .await?;

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{ConnectionTrait, Database, Statement};

    async fn setup() -> (DatabaseConnection, Uuid) {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("create in-memory db");
        Migrator::up(&db, None).await.expect("apply migrations");

        let tenant_id = Uuid::new_v4();
        db.execute(Statement::from_sql_and_values(
            db.get_database_backend(),
            "INSERT INTO tenants (id, name) VALUES (?, ?)",
            vec![tenant_id.into(), "Test Tenant".into()],
        ))
        .await
        .expect("insert tenant");

        (db, tenant_id)
    }

    fn new_broadcast(contacts: Vec<Contact>) -> NewBroadcast {
        NewBroadcast {
            name: "Spring Promo".to_string(),
            account_id: "acct-1".to_string(),
            sender_id: "sender-1".to_string(),
            template_name: "welcome".to_string(),
            template_language: "en".to_string(),
            template_components: None,
            contacts,
            timezone: None,
            time_window_start: None,
            time_window_end: None,
            enable_deduplication: false,
            sync_integration_id: None,
        }
    }

    #[tokio::test]
    async fn create_and_find_round_trip() {
        let (db, tenant_id) = setup().await;
        let repo = BroadcastRepository::new(db);

        let created = repo
            .create(
                tenant_id,
                new_broadcast(vec![Contact::new("Ada", "+15550001")]),
            )
            .await
            .expect("create broadcast");

        assert_eq!(created.status, "pending");
        assert_eq!(created.current_index, 0);

        let found = repo
            .find_by_tenant(tenant_id, created.id)
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(found.name, "Spring Promo");

        let other_tenant = repo
            .find_by_tenant(Uuid::new_v4(), created.id)
            .await
            .expect("lookup");
        assert!(other_tenant.is_none(), "tenant scoping enforced");
    }

    #[tokio::test]
    async fn guarded_transition_checks_current_status() {
        let (db, tenant_id) = setup().await;
        let repo = BroadcastRepository::new(db);
        let created = repo
            .create(tenant_id, new_broadcast(vec![]))
            .await
            .expect("create");

        let won = repo
            .transition(
                created.id,
                &[BroadcastStatus::Pending],
                BroadcastStatus::Processing,
            )
            .await
            .expect("transition");
        assert!(won);

        // Second start attempt loses the guard
        let won_again = repo
            .transition(
                created.id,
                &[BroadcastStatus::Pending],
                BroadcastStatus::Processing,
            )
            .await
            .expect("transition");
        assert!(!won_again);

        let status = repo
            .current_status(created.id)
            .await
            .expect("status")
            .expect("exists");
        assert_eq!(status, BroadcastStatus::Processing);

        let model = repo
            .find_by_tenant(tenant_id, created.id)
            .await
            .expect("lookup")
            .expect("exists");
        assert!(model.started_at.is_some(), "started_at stamped");
    }

    #[tokio::test]
    async fn started_at_survives_pause_and_resume() {
        let (db, tenant_id) = setup().await;
        let repo = BroadcastRepository::new(db);
        let created = repo
            .create(tenant_id, new_broadcast(vec![]))
            .await
            .expect("create");

        repo.transition(
            created.id,
            &[BroadcastStatus::Pending],
            BroadcastStatus::Processing,
        )
        .await
        .expect("start");
        let first = repo
            .find_by_tenant(tenant_id, created.id)
            .await
            .expect("lookup")
            .expect("exists");
        let stamped = first.started_at.expect("stamped on first start");

        repo.transition(
            created.id,
            &[BroadcastStatus::Processing],
            BroadcastStatus::Paused,
        )
        .await
        .expect("pause");
        repo.transition(
            created.id,
            &[BroadcastStatus::Paused],
            BroadcastStatus::Processing,
        )
        .await
        .expect("resume");

        let resumed = repo
            .find_by_tenant(tenant_id, created.id)
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(
            resumed.started_at,
            Some(stamped),
            "resume keeps the original start stamp"
        );
    }

    #[tokio::test]
    async fn checkpoint_persists_progress() {
        let (db, tenant_id) = setup().await;
        let repo = BroadcastRepository::new(db);
        let mut contacts = vec![Contact::new("Ada", "+15550001"), Contact::new("Grace", "+15550002")];
        let created = repo
            .create(tenant_id, new_broadcast(contacts.clone()))
            .await
            .expect("create");

        contacts[0].status = ContactStatus::Sent;
        repo.write_checkpoint(created.id, &contacts, 1, 1, 0)
            .await
            .expect("checkpoint");

        let model = repo
            .find_by_tenant(tenant_id, created.id)
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(model.current_index, 1);
        assert_eq!(model.sent_count, 1);

        let stored: Vec<Contact> = serde_json::from_value(model.contacts).expect("decode");
        assert_eq!(stored[0].status, ContactStatus::Sent);
        assert_eq!(stored[1].status, ContactStatus::Pending);
    }

    #[tokio::test]
    async fn reopen_for_retry_resets_only_failed() {
        let (db, tenant_id) = setup().await;
        let repo = BroadcastRepository::new(db);

        let mut contacts = vec![Contact::new("Ada", "+15550001"), Contact::new("Grace", "+15550002")];
        contacts[0].status = ContactStatus::Sent;
        contacts[1].status = ContactStatus::Failed;
        contacts[1].retry_attempts = 3;

        let created = repo
            .create(tenant_id, new_broadcast(contacts))
            .await
            .expect("create");
        repo.transition(
            created.id,
            &[BroadcastStatus::Pending],
            BroadcastStatus::Processing,
        )
        .await
        .expect("start");
        repo.transition(
            created.id,
            &[BroadcastStatus::Processing],
            BroadcastStatus::Completed,
        )
        .await
        .expect("complete");

        let reset = repo
            .reopen_for_retry(tenant_id, created.id)
            .await
            .expect("retry")
            .expect("retryable");
        assert_eq!(reset, 1);

        let model = repo
            .find_by_tenant(tenant_id, created.id)
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(model.status, "processing");
        assert_eq!(model.current_index, 1, "resume position at first pending");
        assert_eq!(model.failed_count, 0);

        let stored: Vec<Contact> = serde_json::from_value(model.contacts).expect("decode");
        assert_eq!(stored[0].status, ContactStatus::Sent, "sent contact untouched");
        assert_eq!(stored[1].status, ContactStatus::Pending);
        assert_eq!(stored[1].retry_attempts, 4, "resend cycle counter bumped");
    }

    #[tokio::test]
    async fn reopen_for_retry_rejects_active_broadcast() {
        let (db, tenant_id) = setup().await;
        let repo = BroadcastRepository::new(db);
        let created = repo
            .create(tenant_id, new_broadcast(vec![]))
            .await
            .expect("create");

        let result = repo
            .reopen_for_retry(tenant_id, created.id)
            .await
            .expect("call succeeds");
        assert!(result.is_none(), "pending broadcast is not retryable");
    }

    #[tokio::test]
    async fn delete_refuses_processing_broadcast() {
        let (db, tenant_id) = setup().await;
        let repo = BroadcastRepository::new(db);
        let created = repo
            .create(tenant_id, new_broadcast(vec![]))
            .await
            .expect("create");
        repo.transition(
            created.id,
            &[BroadcastStatus::Pending],
            BroadcastStatus::Processing,
        )
        .await
        .expect("start");

        let deleted = repo
            .delete(tenant_id, created.id)
            .await
            .expect("delete call");
        assert!(!deleted, "processing broadcast is not deletable");

        repo.transition(
            created.id,
            &[BroadcastStatus::Processing],
            BroadcastStatus::Cancelled,
        )
        .await
        .expect("cancel");

        let deleted = repo
            .delete(tenant_id, created.id)
            .await
            .expect("delete call");
        assert!(deleted);
    }

    #[tokio::test]
    async fn due_scheduled_only_returns_past_fire_times() {
        let (db, tenant_id) = setup().await;
        let repo = BroadcastRepository::new(db);
        let now = Utc::now();

        let due = repo
            .create(tenant_id, new_broadcast(vec![]))
            .await
            .expect("create");
        repo.schedule(tenant_id, due.id, now - chrono::Duration::minutes(5), None, None, None)
            .await
            .expect("schedule");

        let future = repo
            .create(tenant_id, new_broadcast(vec![]))
            .await
            .expect("create");
        repo.schedule(
            tenant_id,
            future.id,
            now + chrono::Duration::hours(1),
            None,
            None,
            None,
        )
        .await
        .expect("schedule");

        let due_rows = repo.due_scheduled(now, 100).await.expect("query");
        assert_eq!(due_rows.len(), 1);
        assert_eq!(due_rows[0].id, due.id);
    }
}
