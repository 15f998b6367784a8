//! ExecutionLog entity model
//!
//! One row per sync invocation. Deliberately not related to `sync_jobs` by a foreign
//! key: `job_ref` is a plain string so logs outlive the job row.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "execution_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub job_ref: Option<String>,
    pub account_id: Option<String>,

    pub trigger_type: TriggerType,

    /// Free-form origin, e.g. `http`, `cli`, `cron`
    pub trigger_source: String,

    pub status: ExecutionStatus,

    pub start_time: DateTimeWithTimeZone,
    pub end_time: Option<DateTimeWithTimeZone>,
    pub duration_ms: Option<i64>,

    pub items_processed: i64,
    pub total_reads: i64,
    pub total_writes: i64,

    pub message: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub error_details: Option<JsonValue>,

    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    Default,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    #[sea_orm(string_value = "manual")]
    Manual,
    #[sea_orm(string_value = "scheduled")]
    Scheduled,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "success")]
    Success,
    #[sea_orm(string_value = "failure")]
    Failure,
    #[sea_orm(string_value = "timeout")]
    Timeout,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
