//! # Broadcast API Handlers
//!
//! Tenant-scoped lifecycle endpoints for broadcasts. Every lifecycle
//! operation is a guarded state transition; a request against the wrong
//! state returns 409 with the current status in the message.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, broadcast_not_found, invalid_transition, validation_error};
use crate::models::broadcast::{BroadcastStatus, Model as Broadcast};
use crate::models::contact::{Contact, ContactStatus, count_with_status};
use crate::repositories::BroadcastRepository;
use crate::repositories::broadcast::NewBroadcast;
use crate::server::AppState;
use crate::window::window_open_at;

/// One recipient in a create request.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ContactInput {
    /// Display name for template substitution
    #[schema(example = "Ada Lovelace")]
    pub name: String,
    /// Channel address
    #[schema(example = "+5511999999999")]
    pub address: String,
    /// Extra fields consumed by template-variable substitution
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// Request payload for creating a broadcast
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateBroadcastRequest {
    /// Campaign name; the dedup ledger keys on it
    #[schema(example = "spring-promo")]
    pub name: String,
    /// Provider account routing id
    pub account_id: String,
    /// Sender routing id
    pub sender_id: String,
    /// Message template name
    pub template_name: String,
    /// Template language code (default: en)
    #[serde(default = "default_template_language")]
    pub template_language: String,
    /// Template component layout passed through to the channel sender
    #[serde(default)]
    pub template_components: Option<JsonValue>,
    /// Ordered recipient list
    pub contacts: Vec<ContactInput>,
    /// IANA timezone name for the delivery window
    #[serde(default)]
    pub timezone: Option<String>,
    /// Daily window opening, "HH:MM" local clock time
    #[serde(default)]
    pub time_window_start: Option<String>,
    /// Daily window closing, "HH:MM" local clock time
    #[serde(default)]
    pub time_window_end: Option<String>,
    /// Whether the dedup ledger gates sends for this broadcast
    #[serde(default)]
    pub enable_deduplication: bool,
    /// Optional downstream-sync integration reference
    #[serde(default)]
    pub sync_integration_id: Option<String>,
}

fn default_template_language() -> String {
    "en".to_string()
}

/// Request payload for scheduling a broadcast
#[derive(Debug, Deserialize, ToSchema)]
pub struct ScheduleBroadcastRequest {
    /// Absolute fire time (RFC3339)
    #[schema(example = "2025-07-01T09:00:00Z")]
    pub scheduled_at: DateTime<Utc>,
    /// Replacement timezone for the delivery window
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub time_window_start: Option<String>,
    #[serde(default)]
    pub time_window_end: Option<String>,
}

/// Query parameters for listing broadcasts
#[derive(Debug, Deserialize)]
pub struct ListBroadcastsQuery {
    /// Filter by lifecycle status
    pub status: Option<String>,
    /// Maximum number of broadcasts to return (default 50, max 200)
    pub limit: Option<u64>,
    /// Offset into the result set
    pub offset: Option<u64>,
}

/// Broadcast projection returned by every endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BroadcastInfo {
    pub id: String,
    pub name: String,
    pub account_id: String,
    pub sender_id: String,
    pub template_name: String,
    pub template_language: String,
    /// Current lifecycle status
    #[schema(example = "processing")]
    pub status: String,
    pub total_contacts: usize,
    pub sent_count: i32,
    pub failed_count: i32,
    /// Contacts skipped by the dedup gate
    pub skipped_count: i32,
    /// Next unprocessed contact position
    pub current_index: i32,
    pub scheduled_at: Option<String>,
    pub timezone: Option<String>,
    pub time_window_start: Option<String>,
    pub time_window_end: Option<String>,
    pub enable_deduplication: bool,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Detail projection including the embedded contact list
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BroadcastDetail {
    #[serde(flatten)]
    pub info: BroadcastInfo,
    pub contacts: Vec<Contact>,
}

/// Response payload for the list endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BroadcastsResponse {
    pub broadcasts: Vec<BroadcastInfo>,
}

impl From<&Broadcast> for BroadcastInfo {
    fn from(model: &Broadcast) -> Self {
        let contacts: Vec<Contact> =
            serde_json::from_value(model.contacts.clone()).unwrap_or_default();
        Self {
            id: model.id.to_string(),
            name: model.name.clone(),
            account_id: model.account_id.clone(),
            sender_id: model.sender_id.clone(),
            template_name: model.template_name.clone(),
            template_language: model.template_language.clone(),
            status: model.status.clone(),
            total_contacts: contacts.len(),
            sent_count: model.sent_count,
            failed_count: model.failed_count,
            skipped_count: count_with_status(&contacts, ContactStatus::Skipped),
            current_index: model.current_index,
            scheduled_at: model.scheduled_at.map(|dt| dt.to_rfc3339()),
            timezone: model.timezone.clone(),
            time_window_start: model.time_window_start.clone(),
            time_window_end: model.time_window_end.clone(),
            enable_deduplication: model.enable_deduplication,
            error_message: model.error_message.clone(),
            created_at: model.created_at.to_rfc3339(),
            started_at: model.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: model.completed_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

impl From<Broadcast> for BroadcastDetail {
    fn from(model: Broadcast) -> Self {
        let info = BroadcastInfo::from(&model);
        let contacts: Vec<Contact> = serde_json::from_value(model.contacts).unwrap_or_default();
        Self { info, contacts }
    }
}

fn validate_clock(value: &str) -> bool {
    matches!(
        value.split_once(':'),
        Some((h, m))
            if h.parse::<u32>().map(|h| h < 24).unwrap_or(false)
                && m.parse::<u32>().map(|m| m < 60).unwrap_or(false)
    )
}

fn validate_create(request: &CreateBroadcastRequest) -> Result<(), ApiError> {
    let mut field_errors = serde_json::Map::new();

    if request.name.trim().is_empty() {
        field_errors.insert("name".into(), "must not be empty".into());
    }
    if request.account_id.trim().is_empty() {
        field_errors.insert("account_id".into(), "must not be empty".into());
    }
    if request.sender_id.trim().is_empty() {
        field_errors.insert("sender_id".into(), "must not be empty".into());
    }
    if request.template_name.trim().is_empty() {
        field_errors.insert("template_name".into(), "must not be empty".into());
    }
    if request.contacts.is_empty() {
        field_errors.insert("contacts".into(), "must contain at least one contact".into());
    }
    if request
        .contacts
        .iter()
        .any(|contact| contact.address.trim().is_empty())
    {
        field_errors.insert(
            "contacts.address".into(),
            "every contact needs an address".into(),
        );
    }
    for (field, value) in [
        ("time_window_start", &request.time_window_start),
        ("time_window_end", &request.time_window_end),
    ] {
        if let Some(value) = value {
            if !validate_clock(value) {
                field_errors.insert(field.into(), "must be HH:MM".into());
            }
        }
    }
    if let Some(tz) = &request.timezone {
        if tz.parse::<chrono_tz::Tz>().is_err() {
            field_errors.insert("timezone".into(), "unknown IANA timezone".into());
        }
    }

    if field_errors.is_empty() {
        Ok(())
    } else {
        Err(validation_error(
            "Invalid broadcast definition",
            JsonValue::Object(field_errors),
        ))
    }
}

/// Create a broadcast in `pending` status
#[utoipa::path(
    post,
    path = "/tenants/{tenant_id}/broadcasts",
    params(("tenant_id" = Uuid, Path, description = "Tenant ID")),
    request_body = CreateBroadcastRequest,
    responses(
        (status = 201, description = "Broadcast created", body = BroadcastInfo),
        (status = 400, description = "Validation failed")
    ),
    tag = "broadcasts"
)]
pub async fn create_broadcast(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(request): Json<CreateBroadcastRequest>,
) -> Result<(StatusCode, Json<BroadcastInfo>), ApiError> {
    validate_create(&request)?;

    let contacts = request
        .contacts
        .into_iter()
        .map(|input| {
            let mut contact = Contact::new(input.name, input.address);
            contact.fields = input.fields;
            contact
        })
        .collect();

    let repo = BroadcastRepository::new(state.db.clone());
    let model = repo
        .create(
            tenant_id,
            NewBroadcast {
                name: request.name,
                account_id: request.account_id,
                sender_id: request.sender_id,
                template_name: request.template_name,
                template_language: request.template_language,
                template_components: request.template_components,
                contacts,
                timezone: request.timezone,
                time_window_start: request.time_window_start,
                time_window_end: request.time_window_end,
                enable_deduplication: request.enable_deduplication,
                sync_integration_id: request.sync_integration_id,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(BroadcastInfo::from(&model))))
}

/// List broadcasts for a tenant
#[utoipa::path(
    get,
    path = "/tenants/{tenant_id}/broadcasts",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant ID"),
        ("status" = Option<String>, Query, description = "Filter by lifecycle status"),
        ("limit" = Option<u64>, Query, description = "Maximum results (default 50, max 200)"),
        ("offset" = Option<u64>, Query, description = "Result offset")
    ),
    responses(
        (status = 200, description = "Broadcasts for the tenant", body = BroadcastsResponse)
    ),
    tag = "broadcasts"
)]
pub async fn list_broadcasts(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<ListBroadcastsQuery>,
) -> Result<Json<BroadcastsResponse>, ApiError> {
    if let Some(status) = &query.status {
        if BroadcastStatus::parse(status).is_none() {
            return Err(validation_error(
                "Unknown status filter",
                serde_json::json!({ "status": status }),
            ));
        }
    }

    let limit = query.limit.unwrap_or(50).min(200);
    let repo = BroadcastRepository::new(state.db.clone());
    let models = repo
        .list_by_tenant(tenant_id, query.status, Some(limit), query.offset)
        .await?;

    Ok(Json(BroadcastsResponse {
        broadcasts: models.iter().map(BroadcastInfo::from).collect(),
    }))
}

/// Fetch one broadcast including its contact list
#[utoipa::path(
    get,
    path = "/tenants/{tenant_id}/broadcasts/{id}",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant ID"),
        ("id" = Uuid, Path, description = "Broadcast ID")
    ),
    responses(
        (status = 200, description = "Broadcast detail", body = BroadcastDetail),
        (status = 404, description = "Broadcast not found")
    ),
    tag = "broadcasts"
)]
pub async fn get_broadcast(
    State(state): State<AppState>,
    Path((tenant_id, id)): Path<(Uuid, Uuid)>,
) -> Result<Json<BroadcastDetail>, ApiError> {
    let repo = BroadcastRepository::new(state.db.clone());
    let model = repo
        .find_by_tenant(tenant_id, id)
        .await?
        .ok_or_else(|| broadcast_not_found(id))?;

    Ok(Json(BroadcastDetail::from(model)))
}

/// Start a pending broadcast immediately. If the delivery window is
/// currently closed the broadcast parks as `paused` and the scheduler
/// resumes it when the window opens; no sends occur.
#[utoipa::path(
    post,
    path = "/tenants/{tenant_id}/broadcasts/{id}/start",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant ID"),
        ("id" = Uuid, Path, description = "Broadcast ID")
    ),
    responses(
        (status = 200, description = "Broadcast started (or parked as paused)", body = BroadcastInfo),
        (status = 404, description = "Broadcast not found"),
        (status = 409, description = "Broadcast not in a startable state")
    ),
    tag = "broadcasts"
)]
pub async fn start_broadcast(
    State(state): State<AppState>,
    Path((tenant_id, id)): Path<(Uuid, Uuid)>,
) -> Result<Json<BroadcastInfo>, ApiError> {
    let repo = BroadcastRepository::new(state.db.clone());
    let model = repo
        .find_by_tenant(tenant_id, id)
        .await?
        .ok_or_else(|| broadcast_not_found(id))?;

    if BroadcastStatus::parse(&model.status) != Some(BroadcastStatus::Pending) {
        return Err(invalid_transition(&model.status, "start"));
    }

    if window_open_at(&model, Utc::now()) {
        let started = repo
            .transition(id, &[BroadcastStatus::Pending], BroadcastStatus::Processing)
            .await?;
        if !started {
            let current = repo.current_status(id).await?;
            return Err(invalid_transition(
                current.map(|s| s.as_str()).unwrap_or("unknown"),
                "start",
            ));
        }
        state.queue.enqueue(tenant_id, id, false).await?;
    } else {
        // Outside the window the broadcast parks; the scheduler re-arms it
        repo.transition(id, &[BroadcastStatus::Pending], BroadcastStatus::Paused)
            .await?;
    }

    reload_info(&repo, tenant_id, id).await
}

/// Schedule a pending broadcast for a later fire time
#[utoipa::path(
    post,
    path = "/tenants/{tenant_id}/broadcasts/{id}/schedule",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant ID"),
        ("id" = Uuid, Path, description = "Broadcast ID")
    ),
    request_body = ScheduleBroadcastRequest,
    responses(
        (status = 200, description = "Broadcast scheduled", body = BroadcastInfo),
        (status = 404, description = "Broadcast not found"),
        (status = 409, description = "Broadcast not in a schedulable state")
    ),
    tag = "broadcasts"
)]
pub async fn schedule_broadcast(
    State(state): State<AppState>,
    Path((tenant_id, id)): Path<(Uuid, Uuid)>,
    Json(request): Json<ScheduleBroadcastRequest>,
) -> Result<Json<BroadcastInfo>, ApiError> {
    for (field, value) in [
        ("time_window_start", &request.time_window_start),
        ("time_window_end", &request.time_window_end),
    ] {
        if let Some(value) = value {
            if !validate_clock(value) {
                return Err(validation_error(
                    "Invalid delivery window",
                    serde_json::json!({ field: "must be HH:MM" }),
                ));
            }
        }
    }

    let repo = BroadcastRepository::new(state.db.clone());
    let model = repo
        .find_by_tenant(tenant_id, id)
        .await?
        .ok_or_else(|| broadcast_not_found(id))?;

    let scheduled = repo
        .schedule(
            tenant_id,
            id,
            request.scheduled_at,
            request.timezone,
            request.time_window_start,
            request.time_window_end,
        )
        .await?;
    if !scheduled {
        return Err(invalid_transition(&model.status, "schedule"));
    }

    reload_info(&repo, tenant_id, id).await
}

/// Pause a processing broadcast; the worker yields at the next contact
#[utoipa::path(
    post,
    path = "/tenants/{tenant_id}/broadcasts/{id}/pause",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant ID"),
        ("id" = Uuid, Path, description = "Broadcast ID")
    ),
    responses(
        (status = 200, description = "Broadcast paused", body = BroadcastInfo),
        (status = 404, description = "Broadcast not found"),
        (status = 409, description = "Broadcast not processing")
    ),
    tag = "broadcasts"
)]
pub async fn pause_broadcast(
    State(state): State<AppState>,
    Path((tenant_id, id)): Path<(Uuid, Uuid)>,
) -> Result<Json<BroadcastInfo>, ApiError> {
    let repo = BroadcastRepository::new(state.db.clone());
    let model = repo
        .find_by_tenant(tenant_id, id)
        .await?
        .ok_or_else(|| broadcast_not_found(id))?;

    let paused = repo
        .transition(id, &[BroadcastStatus::Processing], BroadcastStatus::Paused)
        .await?;
    if !paused {
        return Err(invalid_transition(&model.status, "pause"));
    }

    reload_info(&repo, tenant_id, id).await
}

/// Resume a paused broadcast immediately
#[utoipa::path(
    post,
    path = "/tenants/{tenant_id}/broadcasts/{id}/resume",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant ID"),
        ("id" = Uuid, Path, description = "Broadcast ID")
    ),
    responses(
        (status = 200, description = "Broadcast resumed", body = BroadcastInfo),
        (status = 404, description = "Broadcast not found"),
        (status = 409, description = "Broadcast not paused, or window closed")
    ),
    tag = "broadcasts"
)]
pub async fn resume_broadcast(
    State(state): State<AppState>,
    Path((tenant_id, id)): Path<(Uuid, Uuid)>,
) -> Result<Json<BroadcastInfo>, ApiError> {
    let repo = BroadcastRepository::new(state.db.clone());
    let model = repo
        .find_by_tenant(tenant_id, id)
        .await?
        .ok_or_else(|| broadcast_not_found(id))?;

    if BroadcastStatus::parse(&model.status) != Some(BroadcastStatus::Paused) {
        return Err(invalid_transition(&model.status, "resume"));
    }

    if !window_open_at(&model, Utc::now()) {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "WINDOW_CLOSED",
            "Delivery window is closed; the scheduler will resume this broadcast automatically",
        ));
    }

    let resumed = repo
        .transition(id, &[BroadcastStatus::Paused], BroadcastStatus::Processing)
        .await?;
    if !resumed {
        let current = repo.current_status(id).await?;
        return Err(invalid_transition(
            current.map(|s| s.as_str()).unwrap_or("unknown"),
            "resume",
        ));
    }

    // A pause-era task may still be claimed; only an unclaimed task makes
    // this enqueue redundant. The queue serializes per broadcast on claim.
    if !state.queue.has_queued(id).await? {
        state.queue.enqueue(tenant_id, id, true).await?;
    }

    reload_info(&repo, tenant_id, id).await
}

/// Cancel any non-terminal broadcast; a running worker stops at the next contact
#[utoipa::path(
    post,
    path = "/tenants/{tenant_id}/broadcasts/{id}/cancel",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant ID"),
        ("id" = Uuid, Path, description = "Broadcast ID")
    ),
    responses(
        (status = 200, description = "Broadcast cancelled", body = BroadcastInfo),
        (status = 404, description = "Broadcast not found"),
        (status = 409, description = "Broadcast already terminal")
    ),
    tag = "broadcasts"
)]
pub async fn cancel_broadcast(
    State(state): State<AppState>,
    Path((tenant_id, id)): Path<(Uuid, Uuid)>,
) -> Result<Json<BroadcastInfo>, ApiError> {
    let repo = BroadcastRepository::new(state.db.clone());
    let model = repo
        .find_by_tenant(tenant_id, id)
        .await?
        .ok_or_else(|| broadcast_not_found(id))?;

    let cancelled = repo
        .transition(
            id,
            &[
                BroadcastStatus::Pending,
                BroadcastStatus::Scheduled,
                BroadcastStatus::Processing,
                BroadcastStatus::Paused,
            ],
            BroadcastStatus::Cancelled,
        )
        .await?;
    if !cancelled {
        return Err(invalid_transition(&model.status, "cancel"));
    }

    reload_info(&repo, tenant_id, id).await
}

/// Reopen a completed/failed broadcast, retrying only its failed contacts
#[utoipa::path(
    post,
    path = "/tenants/{tenant_id}/broadcasts/{id}/retry-failed",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant ID"),
        ("id" = Uuid, Path, description = "Broadcast ID")
    ),
    responses(
        (status = 200, description = "Retry run enqueued", body = BroadcastInfo),
        (status = 404, description = "Broadcast not found"),
        (status = 409, description = "Broadcast not retryable or has no failed contacts")
    ),
    tag = "broadcasts"
)]
pub async fn retry_failed_broadcast(
    State(state): State<AppState>,
    Path((tenant_id, id)): Path<(Uuid, Uuid)>,
) -> Result<Json<BroadcastInfo>, ApiError> {
    let repo = BroadcastRepository::new(state.db.clone());
    let model = repo
        .find_by_tenant(tenant_id, id)
        .await?
        .ok_or_else(|| broadcast_not_found(id))?;

    match repo.reopen_for_retry(tenant_id, id).await? {
        None => Err(invalid_transition(&model.status, "retry-failed")),
        Some(0) => Err(ApiError::new(
            StatusCode::CONFLICT,
            "NO_FAILED_CONTACTS",
            "Broadcast has no failed contacts to retry",
        )),
        Some(_) => {
            state.queue.enqueue(tenant_id, id, true).await?;
            reload_info(&repo, tenant_id, id).await
        }
    }
}

/// Delete a broadcast; rejected while it is processing
#[utoipa::path(
    delete,
    path = "/tenants/{tenant_id}/broadcasts/{id}",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant ID"),
        ("id" = Uuid, Path, description = "Broadcast ID")
    ),
    responses(
        (status = 204, description = "Broadcast deleted"),
        (status = 404, description = "Broadcast not found"),
        (status = 409, description = "Broadcast currently processing")
    ),
    tag = "broadcasts"
)]
pub async fn delete_broadcast(
    State(state): State<AppState>,
    Path((tenant_id, id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    let repo = BroadcastRepository::new(state.db.clone());
    let model = repo
        .find_by_tenant(tenant_id, id)
        .await?
        .ok_or_else(|| broadcast_not_found(id))?;

    if BroadcastStatus::parse(&model.status) == Some(BroadcastStatus::Processing) {
        return Err(invalid_transition(&model.status, "delete"));
    }

    let deleted = repo.delete(tenant_id, id).await?;
    if !deleted {
        return Err(invalid_transition(&model.status, "delete"));
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn reload_info(
    repo: &BroadcastRepository,
    tenant_id: Uuid,
    id: Uuid,
) -> Result<Json<BroadcastInfo>, ApiError> {
    let model = repo
        .find_by_tenant(tenant_id, id)
        .await?
        .ok_or_else(|| broadcast_not_found(id))?;
    Ok(Json(BroadcastInfo::from(&model)))
}
