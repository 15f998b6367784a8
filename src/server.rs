//! # Server Configuration
//!
//! Router, shared state and OpenAPI document for the sync control surface.

use std::sync::Arc;

use axum::{
    Router,
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::handlers;
use crate::sync::SyncController;
use crate::telemetry::{TraceContext, with_trace_context};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Arc<AppConfig>,
    pub controller: Arc<SyncController>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/sync/initialize", post(handlers::sync::initialize))
        .route("/sync/execute", post(handlers::sync::execute))
        .route("/sync/status/{job_id}", get(handlers::sync::status))
        .route("/sync/jobs/{job_id}/pause", post(handlers::sync::pause))
        .route("/sync/jobs/{job_id}/cancel", post(handlers::sync::cancel))
        .route("/executions", get(handlers::executions::list_executions))
        .route(
            "/executions/{execution_id}",
            get(handlers::executions::get_execution),
        )
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context))
        .layer(TraceLayer::new_for_http())
}

/// Scope every request in a [`TraceContext`] and echo its id back.
async fn trace_context(request: Request, next: Next) -> Response {
    let context = TraceContext::from_request_id(
        request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    let trace_id = context.trace_id.clone();

    let mut response = with_trace_context(context, next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Starts the server with the given configuration
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let controller = SyncController::from_config(db.clone(), &config)?;
    let state = AppState {
        db,
        config: Arc::new(config.clone()),
        controller: Arc::new(controller),
    };
    let app = create_app(state);

    let addr = config
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %config.profile, "server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::sync::initialize,
        crate::handlers::sync::execute,
        crate::handlers::sync::status,
        crate::handlers::sync::pause,
        crate::handlers::sync::cancel,
        crate::handlers::executions::list_executions,
        crate::handlers::executions::get_execution,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::handlers::sync::ExecuteRequest,
            crate::handlers::executions::ExecutionInfo,
            crate::handlers::executions::ExecutionsResponse,
            crate::sync::InitializeParams,
            crate::sync::InitializeResult,
            crate::sync::BatchResult,
            crate::sync::JobProgress,
            crate::sync::JobCounts,
            crate::models::sync_job::JobStatus,
            crate::models::execution_log::TriggerType,
            crate::models::execution_log::ExecutionStatus,
            crate::error::ApiError,
        )
    ),
    tags(
        (name = "root", description = "Service information"),
        (name = "sync", description = "Sync job lifecycle"),
        (name = "executions", description = "Per-invocation execution history"),
    ),
    info(
        title = "Marketplace Sync API",
        description = "Control surface for paginated marketplace synchronization jobs",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
