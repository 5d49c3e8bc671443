//! Broadcast entity model
//!
//! This module contains the SeaORM entity model for the broadcasts table,
//! one row per bulk-send campaign with the embedded contact list and the
//! progress checkpoint, plus the [`BroadcastStatus`] state machine labels.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle status of a broadcast (see the state machine in the worker and
/// scheduler modules). Stored as text in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastStatus {
    Pending,
    Scheduled,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastStatus::Pending => "pending",
            BroadcastStatus::Scheduled => "scheduled",
            BroadcastStatus::Processing => "processing",
            BroadcastStatus::Paused => "paused",
            BroadcastStatus::Completed => "completed",
            BroadcastStatus::Failed => "failed",
            BroadcastStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(BroadcastStatus::Pending),
            "scheduled" => Some(BroadcastStatus::Scheduled),
            "processing" => Some(BroadcastStatus::Processing),
            "paused" => Some(BroadcastStatus::Paused),
            "completed" => Some(BroadcastStatus::Completed),
            "failed" => Some(BroadcastStatus::Failed),
            "cancelled" => Some(BroadcastStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states accept no further lifecycle transitions, except that
    /// completed/failed may be reopened by retry-failed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BroadcastStatus::Completed | BroadcastStatus::Failed | BroadcastStatus::Cancelled
        )
    }
}

impl std::fmt::Display for BroadcastStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcast entity representing one bulk-send campaign
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "broadcasts")]
pub struct Model {
    /// Unique identifier for the broadcast (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning tenant identifier
    pub tenant_id: Uuid,

    /// Human-readable campaign name; the dedup ledger keys on it
    pub name: String,

    /// Provider account routing id
    pub account_id: String,

    /// Sender routing id (e.g. sender number id)
    pub sender_id: String,

    /// Message template name
    pub template_name: String,

    /// Template language code
    pub template_language: String,

    /// Template component layout, passed through to the channel sender
    #[sea_orm(column_type = "JsonBinary")]
    pub template_components: Option<JsonValue>,

    /// Current lifecycle status (see [`BroadcastStatus`])
    pub status: String,

    /// Ordered contact list as an embedded JSON document; list order defines
    /// the resume position
    #[sea_orm(column_type = "JsonBinary")]
    pub contacts: JsonValue,

    /// Next unprocessed contact position (the resumability checkpoint)
    pub current_index: i32,

    /// Number of contacts delivered successfully
    pub sent_count: i32,

    /// Number of contacts that exhausted their retries
    pub failed_count: i32,

    /// Absolute time at which a scheduled broadcast auto-starts
    pub scheduled_at: Option<DateTimeWithTimeZone>,

    /// IANA timezone name used for the delivery window check
    pub timezone: Option<String>,

    /// Daily window opening, local clock time "HH:MM"
    pub time_window_start: Option<String>,

    /// Daily window closing, local clock time "HH:MM"
    pub time_window_end: Option<String>,

    /// Whether the dedup ledger gates sends for this broadcast
    pub enable_deduplication: bool,

    /// Optional downstream-sync integration reference
    pub sync_integration_id: Option<String>,

    /// Fatal setup error recorded when the broadcast transitions to failed
    pub error_message: Option<String>,

    /// Timestamp when the broadcast was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when processing first started
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the broadcast reached completed
    pub completed_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the broadcast was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tenant::Entity",
        from = "Column::TenantId",
        to = "super::tenant::Column::Id"
    )]
    Tenant,
}

impl Related<super::tenant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tenant.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_round_trip() {
        for status in [
            BroadcastStatus::Pending,
            BroadcastStatus::Scheduled,
            BroadcastStatus::Processing,
            BroadcastStatus::Paused,
            BroadcastStatus::Completed,
            BroadcastStatus::Failed,
            BroadcastStatus::Cancelled,
        ] {
            assert_eq!(BroadcastStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BroadcastStatus::parse("running"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(BroadcastStatus::Completed.is_terminal());
        assert!(BroadcastStatus::Failed.is_terminal());
        assert!(BroadcastStatus::Cancelled.is_terminal());
        assert!(!BroadcastStatus::Paused.is_terminal());
        assert!(!BroadcastStatus::Processing.is_terminal());
    }
}
