//! # Sync API Handlers
//!
//! Job initialization, batch execution, status and pause/cancel.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::parse_uuid;
use crate::error::ApiError;
use crate::models::execution_log::TriggerType;
use crate::server::AppState;
use crate::sync::{BatchResult, ExecuteParams, InitializeParams, InitializeResult, JobProgress};

/// Request body for `POST /sync/execute`
#[derive(Debug, Deserialize, ToSchema)]
pub struct ExecuteRequest {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub job_id: Uuid,
    /// Pages to process in this call; defaults to the job's batch size
    #[schema(example = 10)]
    pub batch_size: Option<u32>,
    /// Restart from this page instead of the job's cursor (replay)
    pub page_start: Option<u32>,
    /// Selects the invocation time budget; defaults to `manual`
    pub trigger: Option<TriggerType>,
}

/// Create a sync job after probing the marketplace for its record count
#[utoipa::path(
    post,
    path = "/sync/initialize",
    request_body = InitializeParams,
    responses(
        (status = 201, description = "Job created", body = InitializeResult, example = json!({
            "job_id": "550e8400-e29b-41d4-a716-446655440000",
            "total_pages": 3,
            "total_records": 250,
            "page_size": 100,
            "batch_size": 10,
            "estimated_completion": "2025-11-10T10:00:09Z"
        })),
        (status = 400, description = "Invalid page or batch size", body = ApiError),
        (status = 502, description = "Marketplace probe failed", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn initialize(
    State(state): State<AppState>,
    payload: Result<Json<InitializeParams>, JsonRejection>,
) -> Result<(StatusCode, Json<InitializeResult>), ApiError> {
    let Json(params) = payload?;
    let result = state.controller.initialize(params).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

/// Process one bounded batch of pages
#[utoipa::path(
    post,
    path = "/sync/execute",
    request_body = ExecuteRequest,
    responses(
        (status = 200, description = "Batch processed", body = BatchResult),
        (status = 400, description = "Invalid batch size or page_start", body = ApiError),
        (status = 404, description = "Job not found", body = ApiError),
        (status = 409, description = "Job already running or finished", body = ApiError),
        (status = 502, description = "Marketplace rejected credentials", body = ApiError),
        (status = 504, description = "Invocation budget exceeded; job is resumable", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn execute(
    State(state): State<AppState>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<BatchResult>, ApiError> {
    let Json(request) = payload?;

    let result = state
        .controller
        .execute(ExecuteParams {
            job_id: request.job_id,
            batch_size: request.batch_size,
            page_start: request.page_start,
            trigger: request.trigger.unwrap_or_default(),
            trigger_source: "http".to_string(),
        })
        .await?;

    Ok(Json(result))
}

/// Read-only job progress
#[utoipa::path(
    get,
    path = "/sync/status/{job_id}",
    params(("job_id" = String, Path, description = "Sync job ID")),
    responses(
        (status = 200, description = "Job progress", body = JobProgress),
        (status = 400, description = "Malformed job ID", body = ApiError),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobProgress>, ApiError> {
    let job_id = parse_uuid("job_id", &job_id)?;
    Ok(Json(state.controller.status(job_id).await?))
}

/// Pause a job; a running batch stops before its next page
#[utoipa::path(
    post,
    path = "/sync/jobs/{job_id}/pause",
    params(("job_id" = String, Path, description = "Sync job ID")),
    responses(
        (status = 200, description = "Job paused", body = JobProgress),
        (status = 404, description = "Job not found", body = ApiError),
        (status = 409, description = "Job already finished", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn pause(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobProgress>, ApiError> {
    let job_id = parse_uuid("job_id", &job_id)?;
    Ok(Json(state.controller.pause(job_id).await?))
}

/// Cancel a job permanently
#[utoipa::path(
    post,
    path = "/sync/jobs/{job_id}/cancel",
    params(("job_id" = String, Path, description = "Sync job ID")),
    responses(
        (status = 200, description = "Job cancelled", body = JobProgress),
        (status = 404, description = "Job not found", body = ApiError),
        (status = 409, description = "Job already finished", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn cancel(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobProgress>, ApiError> {
    let job_id = parse_uuid("job_id", &job_id)?;
    Ok(Json(state.controller.cancel(job_id).await?))
}
