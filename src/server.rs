//! # Server Configuration
//!
//! This module contains the router setup, shared application state, and the
//! service entry point that wires the scheduler and dispatcher alongside the
//! HTTP API.

use std::sync::Arc;

use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use migration::{Migrator, MigratorTrait};

use crate::channel::{ChannelSender, StaticCredentialResolver};
use crate::config::AppConfig;
use crate::db;
use crate::dispatcher::BroadcastDispatcher;
use crate::handlers;
use crate::queue::{DbTaskQueue, TaskQueue};
use crate::repositories::{BroadcastRepository, DedupLedger};
use crate::scheduler::BroadcastScheduler;
use crate::sync_notifier::NoopSyncNotifier;
use crate::telemetry::{self, TraceContext};
use crate::worker::{BroadcastRunner, SendGate};

/// Attach a per-request trace id (incoming `x-request-id` or a generated
/// one) so error responses carry a correlation id.
async fn trace_context(request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    telemetry::with_trace_context(TraceContext { trace_id }, next.run(request)).await
}

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub queue: Arc<dyn TaskQueue>,
    pub config: Arc<AppConfig>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route(
            "/tenants/{tenant_id}/broadcasts",
            post(handlers::broadcasts::create_broadcast).get(handlers::broadcasts::list_broadcasts),
        )
        .route(
            "/tenants/{tenant_id}/broadcasts/{id}",
            get(handlers::broadcasts::get_broadcast),
        )
        .route(
            "/tenants/{tenant_id}/broadcasts/{id}",
            delete(handlers::broadcasts::delete_broadcast),
        )
        .route(
            "/tenants/{tenant_id}/broadcasts/{id}/start",
            post(handlers::broadcasts::start_broadcast),
        )
        .route(
            "/tenants/{tenant_id}/broadcasts/{id}/schedule",
            post(handlers::broadcasts::schedule_broadcast),
        )
        .route(
            "/tenants/{tenant_id}/broadcasts/{id}/pause",
            post(handlers::broadcasts::pause_broadcast),
        )
        .route(
            "/tenants/{tenant_id}/broadcasts/{id}/resume",
            post(handlers::broadcasts::resume_broadcast),
        )
        .route(
            "/tenants/{tenant_id}/broadcasts/{id}/cancel",
            post(handlers::broadcasts::cancel_broadcast),
        )
        .route(
            "/tenants/{tenant_id}/broadcasts/{id}/retry-failed",
            post(handlers::broadcasts::retry_failed_broadcast),
        )
        .layer(middleware::from_fn(trace_context))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Starts the service: database pool, migrations, background scheduler and
/// dispatcher, then the HTTP server until interrupted.
pub async fn run_server(
    config: AppConfig,
    sender: Arc<dyn ChannelSender>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);

    let pool = db::init_pool(&config).await?;
    Migrator::up(&pool, None).await?;

    let queue: Arc<dyn TaskQueue> = Arc::new(DbTaskQueue::new(pool.clone()));
    let repo = BroadcastRepository::new(pool.clone());
    let gate = Arc::new(SendGate::new(config.dispatch.min_send_gap()));

    let runner = Arc::new(BroadcastRunner::new(
        repo.clone(),
        DedupLedger::new(pool.clone()),
        sender,
        Arc::new(StaticCredentialResolver::new(config.channel_token.clone())),
        Arc::new(NoopSyncNotifier),
        Some(gate),
        config.dispatch.clone(),
        config.backoff.policy(),
    ));

    let shutdown = CancellationToken::new();

    let scheduler = BroadcastScheduler::new(config.clone(), repo, queue.clone());
    let scheduler_shutdown = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move {
        if let Err(err) = scheduler.run(scheduler_shutdown).await {
            error!(error = ?err, "Scheduler terminated with error");
        }
    });

    let dispatcher = BroadcastDispatcher::new(config.clone(), queue.clone(), runner);
    let dispatcher_shutdown = shutdown.clone();
    let dispatcher_handle = tokio::spawn(async move {
        if let Err(err) = dispatcher.run(dispatcher_shutdown).await {
            error!(error = ?err, "Dispatcher terminated with error");
        }
    });

    let state = AppState {
        db: pool,
        queue,
        config: config.clone(),
    };
    let app = create_app(state);

    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, profile = %config.profile, "Server listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            serve_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = scheduler_handle.await;
    let _ = dispatcher_handle.await;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::broadcasts::create_broadcast,
        crate::handlers::broadcasts::list_broadcasts,
        crate::handlers::broadcasts::get_broadcast,
        crate::handlers::broadcasts::start_broadcast,
        crate::handlers::broadcasts::schedule_broadcast,
        crate::handlers::broadcasts::pause_broadcast,
        crate::handlers::broadcasts::resume_broadcast,
        crate::handlers::broadcasts::cancel_broadcast,
        crate::handlers::broadcasts::retry_failed_broadcast,
        crate::handlers::broadcasts::delete_broadcast,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::broadcast::BroadcastStatus,
            crate::models::contact::Contact,
            crate::models::contact::ContactStatus,
            crate::models::contact::SyncStatus,
            crate::handlers::broadcasts::ContactInput,
            crate::handlers::broadcasts::CreateBroadcastRequest,
            crate::handlers::broadcasts::ScheduleBroadcastRequest,
            crate::handlers::broadcasts::BroadcastInfo,
            crate::handlers::broadcasts::BroadcastDetail,
            crate::handlers::broadcasts::BroadcastsResponse,
            crate::error::ApiError,
        )
    ),
    info(
        title = "Broadcaster API",
        description = "API for managing bulk-message broadcasts",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
