//! Execution logging.
//!
//! One log entry per invocation, written independently of the job row so the history
//! stays readable even when a job record is damaged or deleted. Entries are mutable
//! while `running` and sealed by [`ExecutionLogger::complete_execution`].

use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::SyncError;
use crate::cursor::ExecutionCursor;
use crate::models::execution_log::{
    ActiveModel, Column, Entity, ExecutionStatus, Model, TriggerType,
};

pub const MAX_LIST_LIMIT: u64 = 100;

/// Trigger metadata recorded when an invocation starts.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStart {
    pub job_ref: Option<String>,
    pub account_id: Option<String>,
    pub trigger_type: TriggerType,
    pub trigger_source: String,
    pub message: Option<String>,
    pub metadata: Option<JsonValue>,
}

/// Partial metrics; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    pub items_processed: Option<i64>,
    pub total_reads: Option<i64>,
    pub total_writes: Option<i64>,
    pub message: Option<String>,
    pub error_details: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub account_id: Option<String>,
    pub job_ref: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub started_after: Option<chrono::DateTime<Utc>>,
    pub started_before: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ExecutionPage {
    pub items: Vec<Model>,
    pub next_cursor: Option<ExecutionCursor>,
}

#[derive(Clone)]
pub struct ExecutionLogger {
    db: DatabaseConnection,
}

impl ExecutionLogger {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, start), fields(job_ref = ?start.job_ref, trigger = ?start.trigger_type))]
    pub async fn start_execution(&self, start: ExecutionStart) -> Result<Uuid, SyncError> {
        let now = Utc::now().fixed_offset();
        let id = Uuid::new_v4();

        let entry = ActiveModel {
            id: Set(id),
            job_ref: Set(start.job_ref),
            account_id: Set(start.account_id),
            trigger_type: Set(start.trigger_type),
            trigger_source: Set(start.trigger_source),
            status: Set(ExecutionStatus::Running),
            start_time: Set(now),
            end_time: Set(None),
            duration_ms: Set(None),
            items_processed: Set(0),
            total_reads: Set(0),
            total_writes: Set(0),
            message: Set(start.message.unwrap_or_default()),
            error_details: Set(None),
            metadata: Set(start.metadata),
            created_at: Set(now),
            updated_at: Set(now),
        };

        entry.insert(&self.db).await.map_err(|e| {
            error!("Failed to insert execution log: {}", e);
            SyncError::from(e)
        })?;

        debug!(execution_id = %id, "execution started");
        Ok(id)
    }

    /// Merge `metrics` into a running entry. Sealed entries are left alone; returns
    /// whether a row changed.
    pub async fn update_execution(
        &self,
        execution_id: Uuid,
        metrics: ExecutionMetrics,
    ) -> Result<bool, SyncError> {
        let now = Utc::now().fixed_offset();
        let mut update = Entity::update_many().col_expr(Column::UpdatedAt, Expr::value(now));
        update = apply_metrics(update, metrics);

        let result = update
            .filter(Column::Id.eq(execution_id))
            .filter(Column::Status.eq(ExecutionStatus::Running))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Seal an entry with its final status. Duration is measured from the stored start
    /// time. Returns `false` when the entry was already sealed.
    #[instrument(skip(self, metrics))]
    pub async fn complete_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        metrics: ExecutionMetrics,
    ) -> Result<bool, SyncError> {
        let Some(entry) = Entity::find_by_id(execution_id).one(&self.db).await? else {
            warn!(%execution_id, "completing unknown execution");
            return Ok(false);
        };

        let now = Utc::now().fixed_offset();
        let duration_ms = (now - entry.start_time).num_milliseconds().max(0);
        let status = if status.is_final() {
            status
        } else {
            ExecutionStatus::Success
        };

        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::EndTime, Expr::value(now))
            .col_expr(Column::DurationMs, Expr::value(duration_ms))
            .col_expr(Column::UpdatedAt, Expr::value(now));
        update = apply_metrics(update, metrics);

        let result = update
            .filter(Column::Id.eq(execution_id))
            .filter(Column::Status.eq(ExecutionStatus::Running))
            .exec(&self.db)
            .await?;

        let sealed = result.rows_affected > 0;
        if sealed {
            info!(%execution_id, ?status, duration_ms, "execution completed");
        }
        Ok(sealed)
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<Option<Model>, SyncError> {
        Ok(Entity::find_by_id(execution_id).one(&self.db).await?)
    }

    /// Newest first, keyset-paginated on `(start_time, id)`.
    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        cursor: Option<ExecutionCursor>,
        limit: u64,
    ) -> Result<ExecutionPage, SyncError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let mut query = Entity::find();

        if let Some(account_id) = &filter.account_id {
            query = query.filter(Column::AccountId.eq(account_id.as_str()));
        }
        if let Some(job_ref) = &filter.job_ref {
            query = query.filter(Column::JobRef.eq(job_ref.as_str()));
        }
        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status));
        }
        if let Some(after) = filter.started_after {
            query = query.filter(Column::StartTime.gte(after.fixed_offset()));
        }
        if let Some(before) = filter.started_before {
            query = query.filter(Column::StartTime.lt(before.fixed_offset()));
        }
        if let Some(cursor) = cursor {
            let start = cursor.start_time.fixed_offset();
            query = query.filter(
                Condition::any()
                    .add(Column::StartTime.lt(start))
                    .add(
                        Condition::all()
                            .add(Column::StartTime.eq(start))
                            .add(Column::Id.lt(cursor.id)),
                    ),
            );
        }

        let mut items = query
            .order_by_desc(Column::StartTime)
            .order_by_desc(Column::Id)
            .limit(limit + 1)
            .all(&self.db)
            .await?;

        let has_more = items.len() as u64 > limit;
        items.truncate(limit as usize);

        let next_cursor = if has_more {
            items.last().map(|last| ExecutionCursor {
                start_time: last.start_time.with_timezone(&Utc),
                id: last.id,
            })
        } else {
            None
        };

        Ok(ExecutionPage { items, next_cursor })
    }

    /// Seal `running` entries older than `older_than` as `timeout`. These are left behind
    /// by invocations that were killed before they could complete their log.
    pub async fn expire_stale_executions(&self, older_than: ChronoDuration) -> Result<u64, SyncError> {
        let cutoff = (Utc::now() - older_than).fixed_offset();
        let stale = Entity::find()
            .filter(Column::Status.eq(ExecutionStatus::Running))
            .filter(Column::StartTime.lt(cutoff))
            .all(&self.db)
            .await?;

        let mut expired = 0;
        for entry in stale {
            let sealed = self
                .complete_execution(
                    entry.id,
                    ExecutionStatus::Timeout,
                    ExecutionMetrics {
                        message: Some("execution abandoned without completing".to_string()),
                        ..ExecutionMetrics::default()
                    },
                )
                .await?;
            if sealed {
                expired += 1;
            }
        }

        if expired > 0 {
            info!(expired, "expired stale executions");
        }
        Ok(expired)
    }
}

fn apply_metrics(
    mut update: sea_orm::UpdateMany<Entity>,
    metrics: ExecutionMetrics,
) -> sea_orm::UpdateMany<Entity> {
    if let Some(items) = metrics.items_processed {
        update = update.col_expr(Column::ItemsProcessed, Expr::value(items));
    }
    if let Some(reads) = metrics.total_reads {
        update = update.col_expr(Column::TotalReads, Expr::value(reads));
    }
    if let Some(writes) = metrics.total_writes {
        update = update.col_expr(Column::TotalWrites, Expr::value(writes));
    }
    if let Some(message) = metrics.message {
        update = update.col_expr(Column::Message, Expr::value(message));
    }
    if let Some(details) = metrics.error_details {
        update = update.col_expr(Column::ErrorDetails, Expr::value(details));
    }
    if let Some(metadata) = metrics.metadata {
        update = update.col_expr(Column::Metadata, Expr::value(metadata));
    }
    update
}
