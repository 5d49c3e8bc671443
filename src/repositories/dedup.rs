//! # Dedup Ledger
//!
//! Append-only record of (tenant, campaign name, recipient) deliveries,
//! backed by a unique index. Broadcasts with deduplication enabled consult
//! the ledger before each send and append after each success; duplicate
//! appends from at-least-once task delivery are absorbed by the index.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

use crate::error::{ApiError, is_unique_violation};
use crate::models::dedup_entry::{ActiveModel, Column, Entity};

/// Repository for dedup ledger operations
#[derive(Clone)]
pub struct DedupLedger {
    db: DatabaseConnection,
}

impl DedupLedger {
    /// Create a new DedupLedger with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Whether a delivery is already recorded for this recipient under the
    /// given campaign name.
    pub async fn exists(
        &self,
        tenant_id: Uuid,
        campaign_name: &str,
        recipient: &str,
    ) -> Result<bool, ApiError> {
        let entry = Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::CampaignName.eq(campaign_name))
            .filter(Column::Recipient.eq(recipient))
            .one(&self.db)
            .await?;

        Ok(entry.is_some())
    }

    /// Record a delivery. Racing duplicate inserts are treated as success.
    pub async fn record(
        &self,
        tenant_id: Uuid,
        campaign_name: &str,
        recipient: &str,
    ) -> Result<(), ApiError> {
        let entry = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            campaign_name: Set(campaign_name.to_string()),
            recipient: Set(recipient.to_string()),
            sent_at: Set(Utc::now().fixed_offset()),
        };

        match entry.insert(&self.db).await {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    campaign_name,
                    recipient,
                    "Dedup entry already recorded"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
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

    #[tokio::test]
    async fn record_then_exists() {
        let (db, tenant_id) = setup().await;
        let ledger = DedupLedger::new(db);

        assert!(!ledger
            .exists(tenant_id, "promo", "+15550001")
            .await
            .expect("exists"));

        ledger
            .record(tenant_id, "promo", "+15550001")
            .await
            .expect("record");

        assert!(ledger
            .exists(tenant_id, "promo", "+15550001")
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn duplicate_record_is_idempotent() {
        let (db, tenant_id) = setup().await;
        let ledger = DedupLedger::new(db);

        ledger
            .record(tenant_id, "promo", "+15550001")
            .await
            .expect("first record");
        ledger
            .record(tenant_id, "promo", "+15550001")
            .await
            .expect("duplicate record is absorbed");
    }

    #[tokio::test]
    async fn ledger_is_scoped_by_campaign_and_tenant() {
        let (db, tenant_id) = setup().await;
        let ledger = DedupLedger::new(db.clone());

        ledger
            .record(tenant_id, "promo", "+15550001")
            .await
            .expect("record");

        assert!(!ledger
            .exists(tenant_id, "other-campaign", "+15550001")
            .await
            .expect("exists"));

        let other_tenant = Uuid::new_v4();
        db.execute(Statement::from_sql_and_values(
            db.get_database_backend(),
            "INSERT INTO tenants (id, name) VALUES (?, ?)",
            vec![other_tenant.into(), "Other Tenant".into()],
        ))
        .await
        .expect("insert tenant");

        assert!(!ledger
            .exists(other_tenant, "promo", "+15550001")
            .await
            .expect("exists"));
    }
}
