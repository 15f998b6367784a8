//! # SyncJob Repository
//!
//! Persistence for the job state machine. Every mutation is a guarded `UPDATE` so
//! concurrent readers never observe a full-row overwrite, and so two invocations can
//! never both believe they own a job.

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QuerySelect, Set, TransactionTrait,
};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::sync_job::{ActiveModel, Column, Entity, JobStatus, Model};
use crate::sync::SyncError;

/// Parameters for a new job row.
#[derive(Debug, Clone)]
pub struct NewSyncJob {
    pub job_type: String,
    pub resource: String,
    pub account_id: Option<String>,
    pub total_pages: i32,
    pub total_records: i64,
    pub page_size: i32,
    pub batch_size: i32,
}

/// Result of processing one page, applied to the job as atomic increments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageOutcome {
    pub succeeded: bool,
    pub new: i64,
    pub updated: i64,
    pub skipped: i64,
    pub errors: i64,
    pub error: Option<String>,
}

/// Repository for sync job database operations
pub struct SyncJobRepository {
    db: DatabaseConnection,
}

impl SyncJobRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create(&self, params: NewSyncJob) -> Result<Model, SyncError> {
        let now = Utc::now().fixed_offset();

        let job = ActiveModel {
            id: Set(Uuid::new_v4()),
            job_type: Set(params.job_type),
            resource: Set(params.resource),
            account_id: Set(params.account_id),
            status: Set(JobStatus::Initialized),
            total_pages: Set(params.total_pages),
            total_records: Set(params.total_records),
            page_size: Set(params.page_size),
            batch_size: Set(params.batch_size),
            current_page: Set(0),
            completed_pages: Set(0),
            failed_pages: Set(0),
            failed_page_numbers: Set(None),
            new_count: Set(0),
            updated_count: Set(0),
            skipped_count: Set(0),
            error_count: Set(0),
            lease_id: Set(None),
            lease_expires_at: Set(None),
            version: Set(0),
            started_at: Set(now),
            last_processed_at: Set(None),
            completed_at: Set(None),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let result = job.insert(&self.db).await.map_err(|e| {
            tracing::error!("Failed to create sync job: {}", e);
            SyncError::from(e)
        })?;

        info!(
            job_id = %result.id,
            total_pages = result.total_pages,
            total_records = result.total_records,
            "Sync job created"
        );

        Ok(result)
    }

    pub async fn find(&self, job_id: Uuid) -> Result<Option<Model>, SyncError> {
        Entity::find_by_id(job_id).one(&self.db).await.map_err(|e| {
            tracing::error!("Failed to find sync job: {}", e);
            SyncError::from(e)
        })
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Model, SyncError> {
        self.find(job_id)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))
    }

    /// Status column only; polled between pages to observe pause/cancel.
    pub async fn current_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, SyncError> {
        Ok(Entity::find_by_id(job_id)
            .select_only()
            .column(Column::Status)
            .into_tuple::<JobStatus>()
            .one(&self.db)
            .await?)
    }

    /// Atomically take the execution lease and flip the job to `in_progress`.
    ///
    /// Succeeds only when the job is runnable and no unexpired lease is held. A losing
    /// caller gets `ConcurrentExecution`, `JobFinished` or `JobNotFound`.
    pub async fn claim(
        &self,
        job_id: Uuid,
        lease_id: Uuid,
        lease_expires_at: DateTime<FixedOffset>,
    ) -> Result<Model, SyncError> {
        let now = Utc::now().fixed_offset();

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::InProgress))
            .col_expr(Column::LeaseId, Expr::value(lease_id))
            .col_expr(Column::LeaseExpiresAt, Expr::value(lease_expires_at))
            .col_expr(Column::Version, Expr::col(Column::Version).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.is_in(JobStatus::runnable()))
            .filter(
                Condition::any()
                    .add(Column::LeaseId.is_null())
                    .add(Column::LeaseExpiresAt.lt(now)),
            )
            .exec(&self.db)
            .await?;

        let job = self.get(job_id).await?;

        if result.rows_affected == 0 {
            if job.status.is_terminal() {
                return Err(SyncError::JobFinished {
                    job_id,
                    status: job.status,
                });
            }
            warn!(%job_id, "claim rejected: job already leased");
            return Err(SyncError::ConcurrentExecution { job_id });
        }

        debug!(%job_id, %lease_id, version = job.version, "job claimed");
        Ok(job)
    }

    /// Drop our lease. A lease taken over after expiry is left alone.
    pub async fn release_lease(&self, job_id: Uuid, lease_id: Uuid) -> Result<bool, SyncError> {
        let result = Entity::update_many()
            .col_expr(Column::LeaseId, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::LeaseExpiresAt,
                Expr::value(Option::<DateTime<FixedOffset>>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(job_id))
            .filter(Column::LeaseId.eq(lease_id))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Apply one page's outcome under our lease.
    ///
    /// Page counters only move on the first visit to a page, or when a replay
    /// turns a failed page into a completed one, so replays never double-count.
    /// Record counters always accumulate. `current_page` never decreases.
    pub async fn record_page(
        &self,
        job_id: Uuid,
        lease_id: Uuid,
        page: i32,
        outcome: &PageOutcome,
    ) -> Result<Model, SyncError> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let job = Entity::find_by_id(job_id)
            .one(&txn)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))?;

        let first_visit = page > job.current_page;
        let mut failed_list = job.failed_page_list();
        let previously_failed = failed_list.contains(&page);

        let (completed_delta, failed_delta) = match (outcome.succeeded, first_visit) {
            (true, true) => (1, 0),
            (true, false) if previously_failed => {
                failed_list.retain(|p| *p != page);
                (1, -1)
            }
            (false, true) => {
                failed_list.push(page);
                (0, 1)
            }
            _ => (0, 0),
        };

        let mut update = Entity::update_many()
            .col_expr(
                Column::CompletedPages,
                Expr::col(Column::CompletedPages).add(completed_delta),
            )
            .col_expr(
                Column::FailedPages,
                Expr::col(Column::FailedPages).add(failed_delta),
            )
            .col_expr(Column::NewCount, Expr::col(Column::NewCount).add(outcome.new))
            .col_expr(
                Column::UpdatedCount,
                Expr::col(Column::UpdatedCount).add(outcome.updated),
            )
            .col_expr(
                Column::SkippedCount,
                Expr::col(Column::SkippedCount).add(outcome.skipped),
            )
            .col_expr(
                Column::ErrorCount,
                Expr::col(Column::ErrorCount).add(outcome.errors),
            )
            .col_expr(Column::LastProcessedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now));

        if completed_delta != 0 || failed_delta != 0 {
            failed_list.sort_unstable();
            let encoded = if failed_list.is_empty() {
                None
            } else {
                Some(json!(failed_list))
            };
            update = update.col_expr(Column::FailedPageNumbers, Expr::value(encoded));
        }
        if let Some(message) = &outcome.error {
            update = update.col_expr(Column::LastError, Expr::value(message.clone()));
        }

        let result = update
            .filter(Column::Id.eq(job_id))
            .filter(Column::LeaseId.eq(lease_id))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            warn!(%job_id, page, "lease lost while recording page");
            return Err(SyncError::ConcurrentExecution { job_id });
        }

        Entity::update_many()
            .col_expr(Column::CurrentPage, Expr::value(page))
            .filter(Column::Id.eq(job_id))
            .filter(Column::CurrentPage.lt(page))
            .exec(&txn)
            .await?;

        let updated = Entity::find_by_id(job_id)
            .one(&txn)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))?;

        txn.commit().await?;
        Ok(updated)
    }

    /// `in_progress -> completed`, releasing the lease. Returns false if the job was
    /// paused or cancelled in the meantime.
    pub async fn mark_completed(&self, job_id: Uuid, lease_id: Uuid) -> Result<bool, SyncError> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Completed))
            .col_expr(Column::CompletedAt, Expr::value(now))
            .col_expr(Column::LeaseId, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::LeaseExpiresAt,
                Expr::value(Option::<DateTime<FixedOffset>>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(JobStatus::InProgress))
            .filter(Column::LeaseId.eq(lease_id))
            .exec(&self.db)
            .await?;

        if result.rows_affected > 0 {
            info!(%job_id, "Sync job completed");
        }
        Ok(result.rows_affected > 0)
    }

    /// Any non-terminal status -> `failed`, releasing whatever lease is held.
    pub async fn mark_failed(&self, job_id: Uuid, message: &str) -> Result<bool, SyncError> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Failed))
            .col_expr(Column::LastError, Expr::value(message.to_string()))
            .col_expr(Column::CompletedAt, Expr::value(now))
            .col_expr(Column::LeaseId, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::LeaseExpiresAt,
                Expr::value(Option::<DateTime<FixedOffset>>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.is_in(JobStatus::runnable()))
            .exec(&self.db)
            .await
            .map_err(|e| {
                error!("Failed to mark sync job failed: {}", e);
                SyncError::from(e)
            })?;

        if result.rows_affected > 0 {
            warn!(%job_id, "Sync job failed: {}", message);
        }
        Ok(result.rows_affected > 0)
    }

    pub async fn set_last_error(&self, job_id: Uuid, message: &str) -> Result<(), SyncError> {
        Entity::update_many()
            .col_expr(Column::LastError, Expr::value(message.to_string()))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(job_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// `initialized | in_progress -> paused`. Idempotent for already paused jobs.
    pub async fn pause(&self, job_id: Uuid) -> Result<Model, SyncError> {
        self.transition(
            job_id,
            JobStatus::Paused,
            &[JobStatus::Initialized, JobStatus::InProgress],
        )
        .await
    }

    /// Any non-terminal status -> `cancelled`. Idempotent for already cancelled jobs.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Model, SyncError> {
        self.transition(job_id, JobStatus::Cancelled, &JobStatus::runnable())
            .await
    }

    async fn transition(
        &self,
        job_id: Uuid,
        target: JobStatus,
        from: &[JobStatus],
    ) -> Result<Model, SyncError> {
        let now = Utc::now().fixed_offset();
        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(target))
            .col_expr(Column::UpdatedAt, Expr::value(now));
        if target.is_terminal() {
            update = update.col_expr(Column::CompletedAt, Expr::value(now));
        }

        let result = update
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.is_in(from.iter().copied()))
            .exec(&self.db)
            .await?;

        let job = self.get(job_id).await?;
        if result.rows_affected == 0 && job.status != target {
            return Err(SyncError::JobFinished {
                job_id,
                status: job.status,
            });
        }

        info!(%job_id, status = %job.status, "Sync job status changed");
        Ok(job)
    }
}
