//! SyncJob entity model
//!
//! One end-to-end ingestion of a marketplace resource. A job is advanced by many short
//! `execute` invocations; the row holds the resumable cursor (`current_page`), the
//! progress counters, and the execution lease that serializes invocations.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Kind of sync, e.g. `full_catalog`
    pub job_type: String,

    /// Marketplace resource path the job pages through
    pub resource: String,

    pub account_id: Option<String>,

    pub status: JobStatus,

    pub total_pages: i32,
    pub total_records: i64,
    pub page_size: i32,

    /// Default number of pages processed per invocation
    pub batch_size: i32,

    /// Highest page number processed so far; never decreases
    pub current_page: i32,
    pub completed_pages: i32,
    pub failed_pages: i32,

    /// Page numbers whose last attempt failed (JSON array of integers)
    #[sea_orm(column_type = "JsonBinary")]
    pub failed_page_numbers: Option<JsonValue>,

    pub new_count: i64,
    pub updated_count: i64,
    pub skipped_count: i64,
    pub error_count: i64,

    /// Holder of the execution lease, if any
    pub lease_id: Option<Uuid>,
    pub lease_expires_at: Option<DateTimeWithTimeZone>,

    /// Incremented on every successful claim
    pub version: i32,

    pub started_at: DateTimeWithTimeZone,
    pub last_processed_at: Option<DateTimeWithTimeZone>,
    pub completed_at: Option<DateTimeWithTimeZone>,
    pub last_error: Option<String>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

/// Lifecycle of a sync job.
///
/// `paused <-> in_progress` is the only transition that can go back and forth;
/// `completed`, `failed` and `cancelled` are terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[sea_orm(string_value = "initialized")]
    Initialized,
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "paused")]
    Paused,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Initialized => "initialized",
            JobStatus::InProgress => "in_progress",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses from which an `execute` call may claim the job.
    pub fn runnable() -> [JobStatus; 3] {
        [
            JobStatus::Initialized,
            JobStatus::InProgress,
            JobStatus::Paused,
        ]
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Model {
    /// Failed page numbers decoded from the JSON column.
    pub fn failed_page_list(&self) -> Vec<i32> {
        decode_page_list(self.failed_page_numbers.as_ref())
    }

    /// True while an unexpired lease is held.
    pub fn is_leased(&self, now: DateTimeWithTimeZone) -> bool {
        self.lease_id.is_some() && self.lease_expires_at.is_some_and(|expires| expires > now)
    }
}

pub(crate) fn decode_page_list(value: Option<&JsonValue>) -> Vec<i32> {
    value
        .and_then(|v| v.as_array())
        .map(|pages| {
            pages
                .iter()
                .filter_map(|p| p.as_i64())
                .filter_map(|p| i32::try_from(p).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::runnable().iter().any(|s| s.is_terminal()));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(JobStatus::InProgress).unwrap(),
            json!("in_progress")
        );
        assert_eq!(JobStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn page_list_ignores_garbage() {
        let value = json!([2, "x", 7, -1]);
        assert_eq!(decode_page_list(Some(&value)), vec![2, 7, -1]);
        assert!(decode_page_list(None).is_empty());
        assert!(decode_page_list(Some(&json!({"a": 1}))).is_empty());
    }
}
