//! Job controller.
//!
//! Owns the job state machine and drives one bounded batch of pages per `execute`
//! call: fetch -> resolve -> merge -> write, then atomic progress increments on the job
//! row. A job spans many short invocations; each one takes the execution lease first
//! and runs under a trigger-specific time budget.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{Instrument, error, info, info_span, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::SyncError;
use super::batch_writer::BatchWriter;
use super::execution_logger::{ExecutionLogger, ExecutionMetrics, ExecutionStart};
use super::fetcher::PaginatedFetcher;
use super::merge::{FieldPolicy, MergeEngine};
use crate::config::AppConfig;
use crate::marketplace::{
    MarketplaceClient, ProxyFilters, ProxySelection, ProxyStrategy, StaticProxyPool,
};
use crate::models::execution_log::{ExecutionStatus, TriggerType};
use crate::models::sync_job::{JobStatus, Model as SyncJobModel};
use crate::repositories::stored_entity::{EntityStore, SeaOrmEntityStore};
use crate::repositories::sync_job::{NewSyncJob, PageOutcome, SyncJobRepository};
use crate::telemetry::{METRIC_PAGES_TOTAL, METRIC_RECORDS_TOTAL};

const DEFAULT_JOB_TYPE: &str = "full_catalog";
/// Ten years
const MAX_ESTIMATE_SECS: u64 = 10 * 365 * 24 * 3600;

/// Sizing and time budgets for the controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub resource: String,
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub default_batch_size: u32,
    pub max_batch_size: u32,
    pub manual_timeout: Duration,
    pub scheduled_timeout: Duration,
    pub lease_grace: Duration,
    pub estimated_page_seconds: u64,
    pub write_batch_limit: usize,
}

impl ControllerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let sync = &config.sync;
        Self {
            resource: config.marketplace.resource.clone(),
            default_page_size: sync.default_page_size,
            max_page_size: sync.max_page_size,
            default_batch_size: sync.default_batch_size,
            max_batch_size: sync.max_batch_size,
            manual_timeout: Duration::from_secs(sync.manual_timeout_secs),
            scheduled_timeout: Duration::from_secs(sync.scheduled_timeout_secs),
            lease_grace: Duration::from_secs(sync.lease_grace_secs),
            estimated_page_seconds: sync.estimated_page_seconds,
            write_batch_limit: sync.write_batch_limit,
        }
    }

    pub fn timeout_for(&self, trigger: TriggerType) -> Duration {
        match trigger {
            TriggerType::Manual => self.manual_timeout,
            TriggerType::Scheduled => self.scheduled_timeout,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct InitializeParams {
    /// Defaults to `full_catalog`
    pub job_type: Option<String>,
    pub account_id: Option<String>,
    pub page_size: Option<u32>,
    /// Default pages per `execute` call
    pub batch_size: Option<u32>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct InitializeResult {
    pub job_id: Uuid,
    pub total_pages: i32,
    pub total_records: i64,
    pub page_size: i32,
    pub batch_size: i32,
    /// Rough wall-clock estimate assuming back-to-back batches
    pub estimated_completion: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExecuteParams {
    pub job_id: Uuid,
    pub batch_size: Option<u32>,
    pub page_start: Option<u32>,
    pub trigger: TriggerType,
    pub trigger_source: String,
}

impl ExecuteParams {
    pub fn manual(job_id: Uuid) -> Self {
        Self {
            job_id,
            batch_size: None,
            page_start: None,
            trigger: TriggerType::Manual,
            trigger_source: "api".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BatchResult {
    pub job_id: Uuid,
    pub execution_id: Uuid,
    pub status: JobStatus,
    pub start_page: i32,
    /// Last page this call was allowed to process
    pub end_page: i32,
    pub pages_completed: u32,
    pub pages_failed: u32,
    pub records_processed: u64,
    pub new: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    pub has_more: bool,
    pub next_page: Option<i32>,
    /// Set when a pause or cancel cut the batch short
    pub stopped_reason: Option<JobStatus>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobCounts {
    pub new: i64,
    pub updated: i64,
    pub skipped: i64,
    pub errors: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub total_pages: i32,
    pub total_records: i64,
    pub page_size: i32,
    pub batch_size: i32,
    pub current_page: i32,
    pub completed_pages: i32,
    pub failed_pages: i32,
    pub failed_page_numbers: Vec<i32>,
    pub progress_percentage: f64,
    pub counts: JobCounts,
    /// True while an invocation holds the execution lease
    pub is_running: bool,
    pub started_at: DateTime<Utc>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&SyncJobModel> for JobProgress {
    fn from(job: &SyncJobModel) -> Self {
        let progress_percentage = if job.total_pages > 0 {
            let raw = job.completed_pages as f64 / job.total_pages as f64 * 100.0;
            (raw * 100.0).round() / 100.0
        } else if job.status == JobStatus::Completed {
            100.0
        } else {
            0.0
        };

        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            status: job.status,
            total_pages: job.total_pages,
            total_records: job.total_records,
            page_size: job.page_size,
            batch_size: job.batch_size,
            current_page: job.current_page,
            completed_pages: job.completed_pages,
            failed_pages: job.failed_pages,
            failed_page_numbers: job.failed_page_list(),
            progress_percentage,
            counts: JobCounts {
                new: job.new_count,
                updated: job.updated_count,
                skipped: job.skipped_count,
                errors: job.error_count,
            },
            is_running: job.is_leased(Utc::now().fixed_offset()),
            started_at: job.started_at.with_timezone(&Utc),
            last_processed_at: job.last_processed_at.map(|t| t.with_timezone(&Utc)),
            completed_at: job.completed_at.map(|t| t.with_timezone(&Utc)),
            last_error: job.last_error.clone(),
        }
    }
}

/// Running totals of one invocation, readable after a timeout drops the page loop.
#[derive(Debug, Default)]
struct BatchProgress {
    pages_completed: u32,
    pages_failed: u32,
    records: u64,
    new: u64,
    updated: u64,
    skipped: u64,
    errors: u64,
    last_page: Option<i32>,
    stopped: Option<JobStatus>,
}

impl BatchProgress {
    fn metrics(&self) -> ExecutionMetrics {
        ExecutionMetrics {
            items_processed: Some(self.records as i64),
            total_reads: Some((self.pages_completed + self.pages_failed) as i64),
            total_writes: Some((self.new + self.updated) as i64),
            ..ExecutionMetrics::default()
        }
    }
}

pub struct SyncController {
    jobs: SyncJobRepository,
    fetcher: PaginatedFetcher,
    merge: MergeEngine,
    writer: BatchWriter,
    logger: ExecutionLogger,
    settings: ControllerSettings,
}

impl SyncController {
    pub fn new(
        db: DatabaseConnection,
        fetcher: PaginatedFetcher,
        store: Arc<dyn EntityStore>,
        policy: FieldPolicy,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            jobs: SyncJobRepository::new(db.clone()),
            fetcher,
            merge: MergeEngine::new(store.clone(), policy),
            writer: BatchWriter::new(store, settings.write_batch_limit),
            logger: ExecutionLogger::new(db),
            settings,
        }
    }

    /// Wire the production collaborators from configuration.
    pub fn from_config(db: DatabaseConnection, config: &AppConfig) -> Result<Self, SyncError> {
        let mut client = MarketplaceClient::new(&config.marketplace)?;

        let pool = StaticProxyPool::from_config(&config.proxy)
            .map_err(|e| SyncError::InvalidRequest(format!("invalid proxy url: {e}")))?;
        if let Some(pool) = pool {
            let strategy = match config.proxy.strategy.as_deref() {
                Some(raw) => raw.parse::<ProxyStrategy>().map_err(SyncError::InvalidRequest)?,
                None => ProxyStrategy::default(),
            };
            info!(?strategy, "routing marketplace requests through proxy pool");
            client = client.with_proxy(ProxySelection {
                provider: Arc::new(pool),
                strategy,
                filters: ProxyFilters {
                    region: config.proxy.region.clone(),
                },
            });
        }

        let fetcher = PaginatedFetcher::new(Arc::new(client), config.fetch.clone());
        let store = Arc::new(SeaOrmEntityStore::new(
            db.clone(),
            config.sync.store_collection.clone(),
            config.sync.write_batch_limit,
        ));

        Ok(Self::new(
            db,
            fetcher,
            store,
            FieldPolicy::from_config(&config.sync),
            ControllerSettings::from_config(config),
        ))
    }

    pub fn logger(&self) -> &ExecutionLogger {
        &self.logger
    }

    /// Probe the marketplace for its record count and create an `initialized` job.
    pub async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult, SyncError> {
        let page_size = params.page_size.unwrap_or(self.settings.default_page_size);
        if page_size == 0 || page_size > self.settings.max_page_size {
            return Err(SyncError::InvalidRequest(format!(
                "page_size must be between 1 and {}",
                self.settings.max_page_size
            )));
        }
        let batch_size = self.check_batch_size(params.batch_size)?;

        let probe = self.fetcher.probe().await?;
        let total_records = probe.total_count.ok_or_else(|| {
            SyncError::data_shape("pagination metadata does not include a total record count")
        })?;

        let total_pages = total_records.div_ceil(page_size as u64);
        let total_pages = i32::try_from(total_pages).map_err(|_| {
            SyncError::data_shape(format!("{total_records} records is too many pages"))
        })?;
        let total_records = i64::try_from(total_records)
            .map_err(|_| SyncError::data_shape("total record count out of range"))?;

        let job = self
            .jobs
            .create(NewSyncJob {
                job_type: params
                    .job_type
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_JOB_TYPE.to_string()),
                resource: self.settings.resource.clone(),
                account_id: params.account_id,
                total_pages,
                total_records,
                page_size: page_size as i32,
                batch_size: batch_size as i32,
            })
            .await?;

        let estimate_secs = (total_pages as u64)
            .saturating_mul(self.settings.estimated_page_seconds)
            .min(MAX_ESTIMATE_SECS);
        let estimated_completion = Utc::now() + chrono::Duration::seconds(estimate_secs as i64);

        Ok(InitializeResult {
            job_id: job.id,
            total_pages,
            total_records,
            page_size: job.page_size,
            batch_size: job.batch_size,
            estimated_completion,
        })
    }

    /// Process one bounded batch of pages for a job.
    pub async fn execute(&self, params: ExecuteParams) -> Result<BatchResult, SyncError> {
        let started = Instant::now();
        let job_id = params.job_id;

        let job = self.jobs.get(job_id).await?;
        if job.status.is_terminal() {
            return Err(SyncError::JobFinished {
                job_id,
                status: job.status,
            });
        }

        let batch_size = match params.batch_size {
            Some(size) => self.check_batch_size(Some(size))?,
            None => u32::try_from(job.batch_size.max(1)).unwrap_or(1),
        };
        if let Some(start) = params.page_start
            && (start == 0 || (job.total_pages > 0 && start as i64 > job.total_pages as i64))
        {
            return Err(SyncError::InvalidRequest(format!(
                "page_start must be between 1 and {}",
                job.total_pages
            )));
        }

        let execution_id = self
            .logger
            .start_execution(ExecutionStart {
                job_ref: Some(job_id.to_string()),
                account_id: job.account_id.clone(),
                trigger_type: params.trigger,
                trigger_source: params.trigger_source.clone(),
                message: None,
                metadata: Some(json!({
                    "batch_size": batch_size,
                    "page_start": params.page_start,
                })),
            })
            .await?;

        let budget = self.settings.timeout_for(params.trigger);
        let lease_id = Uuid::new_v4();
        let lease_expires_at = Utc::now()
            + chrono::Duration::from_std(budget + self.settings.lease_grace)
                .unwrap_or_else(|_| chrono::Duration::hours(1));

        let job = match self
            .jobs
            .claim(job_id, lease_id, lease_expires_at.fixed_offset())
            .await
        {
            Ok(job) => job,
            Err(e) => {
                self.seal_failed(execution_id, ExecutionStatus::Failure, &e, &BatchProgress::default())
                    .await;
                return Err(e);
            }
        };

        let start_page = params
            .page_start
            .map(|p| p as i32)
            .unwrap_or(job.current_page + 1);
        let end_page = (start_page + batch_size as i32 - 1).min(job.total_pages);

        info!(
            %job_id,
            %execution_id,
            start_page,
            end_page,
            trigger = ?params.trigger,
            "executing sync batch"
        );

        let mut progress = BatchProgress::default();
        let span = info_span!("sync_batch", %job_id, %execution_id);
        let outcome = tokio::time::timeout(
            budget,
            self.run_pages(&job, lease_id, start_page, end_page, execution_id, &mut progress)
                .instrument(span),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if e.is_fatal() {
                    if let Err(mark_err) = self.jobs.mark_failed(job_id, &e.to_string()).await {
                        error!(%job_id, "failed to mark job failed: {}", mark_err);
                    }
                } else {
                    self.release(job_id, lease_id).await;
                }
                self.seal_failed(execution_id, ExecutionStatus::Failure, &e, &progress)
                    .await;
                return Err(e);
            }
            Err(_) => {
                let error = SyncError::Timeout {
                    budget_ms: budget.as_millis() as u64,
                };
                warn!(%job_id, pages = progress.pages_completed + progress.pages_failed, "{}", error);
                if let Err(e) = self.jobs.set_last_error(job_id, &error.to_string()).await {
                    error!(%job_id, "failed to record timeout: {}", e);
                }
                self.release(job_id, lease_id).await;
                self.seal_failed(execution_id, ExecutionStatus::Timeout, &error, &progress)
                    .await;
                return Err(error);
            }
        }

        let finished = progress.stopped.is_none() && end_page >= job.total_pages;
        if finished {
            self.jobs.mark_completed(job_id, lease_id).await?;
        } else {
            self.release(job_id, lease_id).await;
        }

        let job = self.jobs.get(job_id).await?;
        // A replay behind the cursor must not pull the resume point backwards
        let next_page = progress
            .last_page
            .map(|p| p + 1)
            .unwrap_or(start_page)
            .max(job.current_page + 1);
        let has_more = !job.status.is_terminal() && next_page <= job.total_pages;

        let final_status = if progress.stopped.is_some() {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Success
        };
        let mut metrics = progress.metrics();
        metrics.message = Some(format!(
            "pages {}-{}: {} completed, {} failed",
            start_page, end_page, progress.pages_completed, progress.pages_failed
        ));
        if let Err(e) = self
            .logger
            .complete_execution(execution_id, final_status, metrics)
            .await
        {
            error!(%execution_id, "failed to seal execution log: {}", e);
        }

        info!(
            %job_id,
            status = %job.status,
            pages_completed = progress.pages_completed,
            pages_failed = progress.pages_failed,
            records = progress.records,
            "sync batch finished"
        );

        Ok(BatchResult {
            job_id,
            execution_id,
            status: job.status,
            start_page,
            end_page,
            pages_completed: progress.pages_completed,
            pages_failed: progress.pages_failed,
            records_processed: progress.records,
            new: progress.new,
            updated: progress.updated,
            skipped: progress.skipped,
            errors: progress.errors,
            has_more,
            next_page: has_more.then_some(next_page),
            stopped_reason: progress.stopped,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobProgress, SyncError> {
        let job = self.jobs.get(job_id).await?;
        Ok(JobProgress::from(&job))
    }

    /// Observed by a running batch before its next page.
    pub async fn pause(&self, job_id: Uuid) -> Result<JobProgress, SyncError> {
        let job = self.jobs.pause(job_id).await?;
        Ok(JobProgress::from(&job))
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<JobProgress, SyncError> {
        let job = self.jobs.cancel(job_id).await?;
        Ok(JobProgress::from(&job))
    }

    async fn run_pages(
        &self,
        job: &SyncJobModel,
        lease_id: Uuid,
        start_page: i32,
        end_page: i32,
        execution_id: Uuid,
        progress: &mut BatchProgress,
    ) -> Result<(), SyncError> {
        let page_size = u32::try_from(job.page_size).unwrap_or(1).max(1);

        for page in start_page..=end_page {
            if page > start_page {
                self.fetcher.pause_between_pages().await;
            }

            match self.jobs.current_status(job.id).await? {
                Some(JobStatus::InProgress) => {}
                Some(status) => {
                    info!(page, %status, "job status changed externally, stopping batch");
                    progress.stopped = Some(status);
                    return Ok(());
                }
                None => return Err(SyncError::JobNotFound(job.id)),
            }

            let outcome = match self.process_page(page as u32, page_size).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_fatal() => {
                    error!(page, "fatal error, aborting batch: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(page, "page failed: {}", e);
                    PageOutcome {
                        succeeded: false,
                        error: Some(format!("page {page}: {e}")),
                        ..PageOutcome::default()
                    }
                }
            };

            self.jobs.record_page(job.id, lease_id, page, &outcome).await?;

            if outcome.succeeded {
                progress.pages_completed += 1;
                counter!(METRIC_PAGES_TOTAL, "outcome" => "completed").increment(1);
            } else {
                progress.pages_failed += 1;
                counter!(METRIC_PAGES_TOTAL, "outcome" => "failed").increment(1);
            }
            progress.new += outcome.new as u64;
            progress.updated += outcome.updated as u64;
            progress.skipped += outcome.skipped as u64;
            progress.errors += outcome.errors as u64;
            progress.records += (outcome.new + outcome.updated + outcome.skipped + outcome.errors) as u64;
            progress.last_page = Some(page);

            if let Err(e) = self
                .logger
                .update_execution(execution_id, progress.metrics())
                .await
            {
                warn!(%execution_id, "failed to update execution log: {}", e);
            }
        }

        Ok(())
    }

    /// Fetch, merge and write one page. Chunk failures are absorbed into the error count.
    async fn process_page(&self, page: u32, page_size: u32) -> Result<PageOutcome, SyncError> {
        let data = self.fetcher.fetch_page(page, page_size).await?;
        let plan = self.merge.merge_page(data.items).await?;
        let written = self.writer.flush(&plan.ops).await;

        let outcome = PageOutcome {
            succeeded: true,
            new: written.inserted as i64,
            updated: written.updated as i64,
            skipped: plan.skipped as i64,
            errors: (plan.errors + written.failed) as i64,
            error: written.last_error.map(|e| format!("page {page}: {e}")),
        };

        counter!(METRIC_RECORDS_TOTAL, "outcome" => "new").increment(written.inserted);
        counter!(METRIC_RECORDS_TOTAL, "outcome" => "updated").increment(written.updated);
        counter!(METRIC_RECORDS_TOTAL, "outcome" => "skipped").increment(plan.skipped);
        counter!(METRIC_RECORDS_TOTAL, "outcome" => "error").increment(plan.errors + written.failed);

        Ok(outcome)
    }

    fn check_batch_size(&self, requested: Option<u32>) -> Result<u32, SyncError> {
        let size = requested.unwrap_or(self.settings.default_batch_size);
        if size == 0 || size > self.settings.max_batch_size {
            return Err(SyncError::InvalidRequest(format!(
                "batch_size must be between 1 and {}",
                self.settings.max_batch_size
            )));
        }
        Ok(size)
    }

    async fn release(&self, job_id: Uuid, lease_id: Uuid) {
        if let Err(e) = self.jobs.release_lease(job_id, lease_id).await {
            error!(%job_id, "failed to release execution lease: {}", e);
        }
    }

    async fn seal_failed(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error: &SyncError,
        progress: &BatchProgress,
    ) {
        let mut metrics = progress.metrics();
        metrics.message = Some(error.to_string());
        metrics.error_details = Some(json!({
            "class": format!("{:?}", error.class()),
            "upstream_status": error.upstream_status(),
        }));
        if let Err(e) = self
            .logger
            .complete_execution(execution_id, status, metrics)
            .await
        {
            error!(%execution_id, "failed to seal execution log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn job(total_pages: i32, completed_pages: i32, status: JobStatus) -> SyncJobModel {
        let now = Utc::now().with_timezone(&FixedOffset::east_opt(0).unwrap());
        SyncJobModel {
            id: Uuid::new_v4(),
            job_type: "full_catalog".into(),
            resource: "products".into(),
            account_id: None,
            status,
            total_pages,
            total_records: 0,
            page_size: 100,
            batch_size: 10,
            current_page: completed_pages,
            completed_pages,
            failed_pages: 0,
            failed_page_numbers: Some(json!([2])),
            new_count: 0,
            updated_count: 0,
            skipped_count: 0,
            error_count: 0,
            lease_id: Some(Uuid::new_v4()),
            lease_expires_at: Some(now + chrono::Duration::minutes(5)),
            version: 1,
            started_at: now,
            last_processed_at: None,
            completed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn progress_percentage_is_rounded() {
        let progress = JobProgress::from(&job(3, 1, JobStatus::InProgress));
        assert_eq!(progress.progress_percentage, 33.33);
        assert!(progress.is_running);
        assert_eq!(progress.failed_page_numbers, vec![2]);
    }

    #[test]
    fn empty_completed_job_reports_full_progress() {
        assert_eq!(
            JobProgress::from(&job(0, 0, JobStatus::Completed)).progress_percentage,
            100.0
        );
        assert_eq!(
            JobProgress::from(&job(0, 0, JobStatus::Initialized)).progress_percentage,
            0.0
        );
    }

    #[test]
    fn scheduled_triggers_get_the_shorter_budget() {
        let settings = ControllerSettings::from_config(&AppConfig::default());
        assert!(
            settings.timeout_for(TriggerType::Scheduled) < settings.timeout_for(TriggerType::Manual)
        );
    }
}
