//! # Tests for Handlers
//!
//! This module contains unit tests for API handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    response::Json,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, Statement};
use tower::util::ServiceExt;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::handlers::broadcasts::{
    self, ContactInput, CreateBroadcastRequest, ScheduleBroadcastRequest,
};
use crate::handlers::root;
use crate::models::broadcast::BroadcastStatus;
use crate::queue::{InMemoryTaskQueue, TaskQueue};
use crate::repositories::BroadcastRepository;
use crate::server::{AppState, create_app};

async fn test_state() -> (AppState, Arc<InMemoryTaskQueue>, Uuid) {
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

    let queue = Arc::new(InMemoryTaskQueue::new());
    let state = AppState {
        db,
        queue: queue.clone(),
        config: Arc::new(AppConfig::default()),
    };
    (state, queue, tenant_id)
}

fn create_request(contacts: Vec<ContactInput>) -> CreateBroadcastRequest {
    CreateBroadcastRequest {
        name: "spring-promo".to_string(),
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

fn contact(name: &str, address: &str) -> ContactInput {
    ContactInput {
        name: name.to_string(),
        address: address.to_string(),
        fields: BTreeMap::new(),
    }
}

#[tokio::test]
async fn root_returns_service_info() {
    let Json(info) = root().await;
    assert_eq!(info.name, "broadcaster");
    assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn create_broadcast_starts_pending() {
    let (state, _queue, tenant_id) = test_state().await;

    let (status, Json(info)) = broadcasts::create_broadcast(
        State(state),
        Path(tenant_id),
        Json(create_request(vec![contact("Ada", "+1")])),
    )
    .await
    .expect("create succeeds");

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(info.status, "pending");
    assert_eq!(info.total_contacts, 1);
    assert_eq!(info.sent_count, 0);
}

#[tokio::test]
async fn create_broadcast_rejects_empty_contacts() {
    let (state, _queue, tenant_id) = test_state().await;

    let err = broadcasts::create_broadcast(
        State(state),
        Path(tenant_id),
        Json(create_request(vec![])),
    )
    .await
    .expect_err("empty contact list rejected");

    assert_eq!(err.status, StatusCode::BAD_REQUEST);
    assert_eq!(err.code.as_ref(), "VALIDATION_FAILED");
}

#[tokio::test]
async fn start_enqueues_run_task() {
    let (state, queue, tenant_id) = test_state().await;

    let (_, Json(info)) = broadcasts::create_broadcast(
        State(state.clone()),
        Path(tenant_id),
        Json(create_request(vec![contact("Ada", "+1")])),
    )
    .await
    .expect("create");
    let id: Uuid = info.id.parse().expect("uuid");

    let Json(started) = broadcasts::start_broadcast(State(state), Path((tenant_id, id)))
        .await
        .expect("start");

    assert_eq!(started.status, "processing");
    assert!(queue.has_active(id).await.expect("has_active"));
}

#[tokio::test]
async fn start_outside_window_parks_as_paused() {
    let (state, queue, tenant_id) = test_state().await;

    let mut request = create_request(vec![contact("Ada", "+1")]);
    request.timezone = Some("UTC".to_string());
    // A window two minutes ahead is closed right now
    let (start, end) = {
        use chrono::Timelike;
        let now = chrono::Utc::now();
        let minutes = now.hour() * 60 + now.minute();
        let clock = |m: u32| format!("{:02}:{:02}", ((m % 1440) / 60) % 24, m % 60);
        (clock(minutes + 2), clock(minutes + 3))
    };
    request.time_window_start = Some(start);
    request.time_window_end = Some(end);

    let (_, Json(info)) = broadcasts::create_broadcast(
        State(state.clone()),
        Path(tenant_id),
        Json(request),
    )
    .await
    .expect("create");
    let id: Uuid = info.id.parse().expect("uuid");

    let Json(parked) = broadcasts::start_broadcast(State(state), Path((tenant_id, id)))
        .await
        .expect("start");

    assert_eq!(parked.status, "paused", "window closed parks the broadcast");
    assert!(!queue.has_active(id).await.expect("has_active"), "no task enqueued");
}

#[tokio::test]
async fn start_twice_is_a_conflict() {
    let (state, _queue, tenant_id) = test_state().await;

    let (_, Json(info)) = broadcasts::create_broadcast(
        State(state.clone()),
        Path(tenant_id),
        Json(create_request(vec![contact("Ada", "+1")])),
    )
    .await
    .expect("create");
    let id: Uuid = info.id.parse().expect("uuid");

    broadcasts::start_broadcast(State(state.clone()), Path((tenant_id, id)))
        .await
        .expect("first start");
    let err = broadcasts::start_broadcast(State(state), Path((tenant_id, id)))
        .await
        .expect_err("second start rejected");

    assert_eq!(err.status, StatusCode::CONFLICT);
    assert_eq!(err.code.as_ref(), "INVALID_TRANSITION");
    assert!(err.message.contains("processing"));
}

#[tokio::test]
async fn schedule_then_cancel() {
    let (state, _queue, tenant_id) = test_state().await;

    let (_, Json(info)) = broadcasts::create_broadcast(
        State(state.clone()),
        Path(tenant_id),
        Json(create_request(vec![contact("Ada", "+1")])),
    )
    .await
    .expect("create");
    let id: Uuid = info.id.parse().expect("uuid");

    let Json(scheduled) = broadcasts::schedule_broadcast(
        State(state.clone()),
        Path((tenant_id, id)),
        Json(ScheduleBroadcastRequest {
            scheduled_at: chrono::Utc::now() + chrono::Duration::hours(1),
            timezone: None,
            time_window_start: None,
            time_window_end: None,
        }),
    )
    .await
    .expect("schedule");
    assert_eq!(scheduled.status, "scheduled");
    assert!(scheduled.scheduled_at.is_some());

    let Json(cancelled) = broadcasts::cancel_broadcast(State(state.clone()), Path((tenant_id, id)))
        .await
        .expect("cancel");
    assert_eq!(cancelled.status, "cancelled");

    let err = broadcasts::cancel_broadcast(State(state), Path((tenant_id, id)))
        .await
        .expect_err("terminal broadcast cannot be cancelled");
    assert_eq!(err.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn pause_and_resume_round_trip() {
    let (state, queue, tenant_id) = test_state().await;

    let (_, Json(info)) = broadcasts::create_broadcast(
        State(state.clone()),
        Path(tenant_id),
        Json(create_request(vec![contact("Ada", "+1")])),
    )
    .await
    .expect("create");
    let id: Uuid = info.id.parse().expect("uuid");

    broadcasts::start_broadcast(State(state.clone()), Path((tenant_id, id)))
        .await
        .expect("start");
    // Drain the start task so resume enqueues its own
    queue.claim(10).await.expect("drain");

    let Json(paused) = broadcasts::pause_broadcast(State(state.clone()), Path((tenant_id, id)))
        .await
        .expect("pause");
    assert_eq!(paused.status, "paused");

    let Json(resumed) = broadcasts::resume_broadcast(State(state.clone()), Path((tenant_id, id)))
        .await
        .expect("resume");
    assert_eq!(resumed.status, "processing");

    let tasks = queue.claim(10).await.expect("claim");
    assert!(tasks.iter().any(|t| t.broadcast_id == id && t.resume));
}

#[tokio::test]
async fn delete_rejects_processing() {
    let (state, _queue, tenant_id) = test_state().await;

    let (_, Json(info)) = broadcasts::create_broadcast(
        State(state.clone()),
        Path(tenant_id),
        Json(create_request(vec![contact("Ada", "+1")])),
    )
    .await
    .expect("create");
    let id: Uuid = info.id.parse().expect("uuid");

    broadcasts::start_broadcast(State(state.clone()), Path((tenant_id, id)))
        .await
        .expect("start");

    let err = broadcasts::delete_broadcast(State(state.clone()), Path((tenant_id, id)))
        .await
        .expect_err("delete rejected while processing");
    assert_eq!(err.status, StatusCode::CONFLICT);

    broadcasts::cancel_broadcast(State(state.clone()), Path((tenant_id, id)))
        .await
        .expect("cancel");
    let status = broadcasts::delete_broadcast(State(state), Path((tenant_id, id)))
        .await
        .expect("delete after cancel");
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn retry_failed_requires_failed_contacts() {
    let (state, _queue, tenant_id) = test_state().await;
    let repo = BroadcastRepository::new(state.db.clone());

    let (_, Json(info)) = broadcasts::create_broadcast(
        State(state.clone()),
        Path(tenant_id),
        Json(create_request(vec![contact("Ada", "+1")])),
    )
    .await
    .expect("create");
    let id: Uuid = info.id.parse().expect("uuid");

    repo.transition(id, &[BroadcastStatus::Pending], BroadcastStatus::Processing)
        .await
        .expect("start");
    repo.transition(
        id,
        &[BroadcastStatus::Processing],
        BroadcastStatus::Completed,
    )
    .await
    .expect("complete");

    let err = broadcasts::retry_failed_broadcast(State(state), Path((tenant_id, id)))
        .await
        .expect_err("no failed contacts");
    assert_eq!(err.status, StatusCode::CONFLICT);
    assert_eq!(err.code.as_ref(), "NO_FAILED_CONTACTS");
}

#[tokio::test]
async fn unknown_broadcast_is_not_found() {
    let (state, _queue, tenant_id) = test_state().await;

    let err = broadcasts::get_broadcast(State(state), Path((tenant_id, Uuid::new_v4())))
        .await
        .expect_err("missing broadcast");
    assert_eq!(err.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn router_serves_list_endpoint() {
    let (state, _queue, tenant_id) = test_state().await;
    let app = create_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/tenants/{}/broadcasts", tenant_id))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("router response");

    assert_eq!(response.status(), StatusCode::OK);
}
