//! # Execution Log Handlers
//!
//! Read-only access to the per-invocation execution history.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;

use super::parse_uuid;
use crate::cursor::{decode_cursor, encode_cursor};
use crate::error::{ApiError, validation_error};
use crate::models::execution_log::{ExecutionStatus, Model, TriggerType};
use crate::server::AppState;
use crate::sync::ExecutionFilter;

const DEFAULT_LIMIT: u64 = 50;

/// Query parameters for listing executions
#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    pub account_id: Option<String>,
    pub job_id: Option<String>,
    /// One of: running, success, failure, timeout, cancelled
    pub status: Option<String>,
    /// RFC 3339, inclusive
    pub started_after: Option<String>,
    /// RFC 3339, exclusive
    pub started_before: Option<String>,
    /// Default 50, max 100
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ExecutionInfo {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub id: String,
    pub job_ref: Option<String>,
    pub account_id: Option<String>,
    pub trigger_type: TriggerType,
    #[schema(example = "http")]
    pub trigger_source: String,
    pub status: ExecutionStatus,
    #[schema(example = "2025-11-10T10:00:00Z")]
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_ms: Option<i64>,
    pub items_processed: i64,
    pub total_reads: i64,
    pub total_writes: i64,
    pub message: String,
    pub error_details: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
}

impl From<Model> for ExecutionInfo {
    fn from(model: Model) -> Self {
        Self {
            id: model.id.to_string(),
            job_ref: model.job_ref,
            account_id: model.account_id,
            trigger_type: model.trigger_type,
            trigger_source: model.trigger_source,
            status: model.status,
            start_time: model.start_time.to_rfc3339(),
            end_time: model.end_time.map(|t| t.to_rfc3339()),
            duration_ms: model.duration_ms,
            items_processed: model.items_processed,
            total_reads: model.total_reads,
            total_writes: model.total_writes,
            message: model.message,
            error_details: model.error_details,
            metadata: model.metadata,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ExecutionsResponse {
    pub executions: Vec<ExecutionInfo>,
    /// Opaque cursor for the next page (null when exhausted)
    pub next_cursor: Option<String>,
}

/// List executions, newest first
#[utoipa::path(
    get,
    path = "/executions",
    params(
        ("account_id" = Option<String>, Query, description = "Filter by account"),
        ("job_id" = Option<String>, Query, description = "Filter by sync job ID"),
        ("status" = Option<ExecutionStatus>, Query, description = "Filter by execution status"),
        ("started_after" = Option<String>, Query, description = "Executions started at or after this RFC 3339 timestamp"),
        ("started_before" = Option<String>, Query, description = "Executions started before this RFC 3339 timestamp"),
        ("limit" = Option<u32>, Query, description = "Maximum number of entries (default 50, max 100)"),
        ("cursor" = Option<String>, Query, description = "Pagination cursor from a previous response")
    ),
    responses(
        (status = 200, description = "Execution history", body = ExecutionsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError)
    ),
    tag = "executions"
)]
pub async fn list_executions(
    State(state): State<AppState>,
    Query(params): Query<ListExecutionsQuery>,
) -> Result<Json<ExecutionsResponse>, ApiError> {
    let limit = match params.limit {
        Some(0) => {
            return Err(validation_error(
                "Invalid limit",
                serde_json::json!({ "limit": "Minimum allowed limit is 1" }),
            ));
        }
        Some(limit) if limit as u64 > crate::sync::execution_logger::MAX_LIST_LIMIT => {
            return Err(validation_error(
                "Invalid limit",
                serde_json::json!({ "limit": "Maximum allowed limit is 100" }),
            ));
        }
        Some(limit) => limit as u64,
        None => DEFAULT_LIMIT,
    };

    let status = match params.status.as_deref() {
        None => None,
        Some("running") => Some(ExecutionStatus::Running),
        Some("success") => Some(ExecutionStatus::Success),
        Some("failure") => Some(ExecutionStatus::Failure),
        Some("timeout") => Some(ExecutionStatus::Timeout),
        Some("cancelled") => Some(ExecutionStatus::Cancelled),
        Some(_) => {
            return Err(validation_error(
                "Invalid status",
                serde_json::json!({
                    "status": "Must be one of: running, success, failure, timeout, cancelled"
                }),
            ));
        }
    };

    let job_ref = match &params.job_id {
        Some(raw) => Some(parse_uuid("job_id", raw)?.to_string()),
        None => None,
    };

    let cursor = match &params.cursor {
        Some(raw) => Some(decode_cursor(raw)?),
        None => None,
    };

    let filter = ExecutionFilter {
        account_id: params.account_id.clone(),
        job_ref,
        status,
        started_after: parse_timestamp("started_after", params.started_after.as_deref())?,
        started_before: parse_timestamp("started_before", params.started_before.as_deref())?,
    };

    let page = state
        .controller
        .logger()
        .list_executions(&filter, cursor, limit)
        .await?;

    Ok(Json(ExecutionsResponse {
        executions: page.items.into_iter().map(ExecutionInfo::from).collect(),
        next_cursor: page.next_cursor.as_ref().map(encode_cursor),
    }))
}

/// Fetch a single execution log entry
#[utoipa::path(
    get,
    path = "/executions/{execution_id}",
    params(("execution_id" = String, Path, description = "Execution ID")),
    responses(
        (status = 200, description = "Execution log entry", body = ExecutionInfo),
        (status = 400, description = "Malformed execution ID", body = ApiError),
        (status = 404, description = "Execution not found", body = ApiError)
    ),
    tag = "executions"
)]
pub async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<ExecutionInfo>, ApiError> {
    let execution_id = parse_uuid("execution_id", &execution_id)?;

    let entry = state
        .controller
        .logger()
        .get_execution(execution_id)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "Execution not found"))?;

    Ok(Json(ExecutionInfo::from(entry)))
}

fn parse_timestamp(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(raw)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|_| {
            validation_error(
                &format!("Invalid {} format", field),
                serde_json::json!({ field: "Must be a valid ISO 8601 timestamp (RFC 3339)" }),
            )
        })
}
