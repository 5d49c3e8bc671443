//! DedupEntry entity model
//!
//! Append-only ledger rows; existence of a (tenant, campaign name,
//! recipient) row means that campaign already reached the recipient.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "dedup_entries")]
pub struct Model {
    /// Unique identifier for the ledger entry (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning tenant identifier
    pub tenant_id: Uuid,

    /// Campaign name shared across broadcast instances
    pub campaign_name: String,

    /// Recipient channel address
    pub recipient: String,

    /// Timestamp of the confirmed send that produced this entry
    pub sent_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
