//! Contact document embedded in a broadcast's JSON contact list.
//!
//! Contacts are stored in list order inside the parent broadcast row; the
//! order defines the resume position, so contacts are never reordered or
//! individually deleted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Per-contact delivery status within a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    #[default]
    Pending,
    Sent,
    Failed,
    Skipped,
}

/// Downstream-sync outcome recorded by the external-sync path. The engine
/// writes this field but never reads it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Missing,
    Created,
    Error,
}

/// One recipient within a broadcast's contact list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Contact {
    /// Display name for template substitution
    pub name: String,

    /// Channel address (e.g. E.164 phone number)
    pub address: String,

    /// Extra row fields consumed only by template-variable substitution
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,

    /// Current delivery status
    #[serde(default)]
    pub status: ContactStatus,

    /// Last failure reason, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Provider message id recorded on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Timestamp of the final send attempt (success or exhaustion)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,

    /// Count of resend cycles across retry-failed operations. Bumped only
    /// when a failed contact is reopened for another run; exhausting the
    /// in-run attempt budget does not increment it.
    #[serde(default)]
    pub retry_attempts: i32,

    /// Downstream-sync status, written by the external-sync path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,
}

impl Contact {
    /// Create a fresh pending contact.
    pub fn new<S: Into<String>>(name: S, address: S) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            fields: BTreeMap::new(),
            status: ContactStatus::Pending,
            error: None,
            message_id: None,
            sent_at: None,
            retry_attempts: 0,
            sync_status: None,
        }
    }

    /// Whether this contact was already handled and must be skipped on resume.
    pub fn is_settled(&self) -> bool {
        matches!(self.status, ContactStatus::Sent | ContactStatus::Skipped)
    }
}

/// Count contacts in the given status.
pub fn count_with_status(contacts: &[Contact], status: ContactStatus) -> i32 {
    contacts.iter().filter(|c| c.status == status).count() as i32
}
