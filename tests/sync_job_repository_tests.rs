mod test_utils;

use chrono::{Duration as ChronoDuration, Utc};
use marketplace_sync::models::sync_job::{JobStatus, Model};
use marketplace_sync::repositories::SyncJobRepository;
use marketplace_sync::repositories::sync_job::{NewSyncJob, PageOutcome};
use marketplace_sync::sync::SyncError;
use test_utils::setup_test_db;
use uuid::Uuid;

async fn repo_with_job(total_pages: i32) -> (SyncJobRepository, Model) {
    let db = setup_test_db().await.unwrap();
    let repo = SyncJobRepository::new(db);
    let job = repo
        .create(NewSyncJob {
            job_type: "full_catalog".to_string(),
            resource: "products".to_string(),
            account_id: Some("acme".to_string()),
            total_pages,
            total_records: total_pages as i64 * 100,
            page_size: 100,
            batch_size: 5,
        })
        .await
        .unwrap();
    (repo, job)
}

fn lease_expiry() -> chrono::DateTime<chrono::FixedOffset> {
    (Utc::now() + ChronoDuration::minutes(5)).fixed_offset()
}

fn ok_page(new: i64) -> PageOutcome {
    PageOutcome {
        succeeded: true,
        new,
        ..PageOutcome::default()
    }
}

fn failed_page(page: i32) -> PageOutcome {
    PageOutcome {
        succeeded: false,
        error: Some(format!("page {page}: upstream unavailable")),
        ..PageOutcome::default()
    }
}

#[tokio::test]
async fn new_job_starts_initialized_and_unleased() {
    let (repo, job) = repo_with_job(3).await;

    assert_eq!(job.status, JobStatus::Initialized);
    assert_eq!(job.current_page, 0);
    assert!(job.lease_id.is_none());
    assert!(job.failed_page_list().is_empty());
    assert_eq!(
        repo.current_status(job.id).await.unwrap(),
        Some(JobStatus::Initialized)
    );
    assert_eq!(repo.current_status(Uuid::new_v4()).await.unwrap(), None);
    assert!(matches!(
        repo.get(Uuid::new_v4()).await,
        Err(SyncError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn claim_is_exclusive_until_released() {
    let (repo, job) = repo_with_job(3).await;
    let first = Uuid::new_v4();

    let claimed = repo.claim(job.id, first, lease_expiry()).await.unwrap();
    assert_eq!(claimed.status, JobStatus::InProgress);
    assert_eq!(claimed.lease_id, Some(first));
    assert_eq!(claimed.version, job.version + 1);

    let err = repo
        .claim(job.id, Uuid::new_v4(), lease_expiry())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ConcurrentExecution { .. }));

    // Only the holder can release
    assert!(!repo.release_lease(job.id, Uuid::new_v4()).await.unwrap());
    assert!(repo.release_lease(job.id, first).await.unwrap());

    repo.claim(job.id, Uuid::new_v4(), lease_expiry())
        .await
        .unwrap();
}

#[tokio::test]
async fn expired_lease_can_be_taken_over() {
    let (repo, job) = repo_with_job(3).await;
    let stale = (Utc::now() - ChronoDuration::seconds(1)).fixed_offset();
    repo.claim(job.id, Uuid::new_v4(), stale).await.unwrap();

    let next = Uuid::new_v4();
    let claimed = repo.claim(job.id, next, lease_expiry()).await.unwrap();
    assert_eq!(claimed.lease_id, Some(next));
}

#[tokio::test]
async fn page_progress_accumulates_under_the_lease() {
    let (repo, job) = repo_with_job(3).await;
    let lease = Uuid::new_v4();
    repo.claim(job.id, lease, lease_expiry()).await.unwrap();

    repo.record_page(job.id, lease, 1, &ok_page(100)).await.unwrap();
    let job = repo
        .record_page(job.id, lease, 2, &failed_page(2))
        .await
        .unwrap();

    assert_eq!(job.current_page, 2);
    assert_eq!(job.completed_pages, 1);
    assert_eq!(job.failed_pages, 1);
    assert_eq!(job.failed_page_list(), vec![2]);
    assert_eq!(job.new_count, 100);
    assert_eq!(job.last_error.as_deref(), Some("page 2: upstream unavailable"));
    assert!(job.last_processed_at.is_some());

    let err = repo
        .record_page(job.id, Uuid::new_v4(), 3, &ok_page(1))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ConcurrentExecution { .. }));
    assert_eq!(repo.get(job.id).await.unwrap().current_page, 2);
}

#[tokio::test]
async fn replays_do_not_double_count_pages() {
    let (repo, job) = repo_with_job(3).await;
    let lease = Uuid::new_v4();
    repo.claim(job.id, lease, lease_expiry()).await.unwrap();

    repo.record_page(job.id, lease, 1, &ok_page(100)).await.unwrap();
    repo.record_page(job.id, lease, 2, &failed_page(2))
        .await
        .unwrap();
    repo.record_page(job.id, lease, 3, &ok_page(50)).await.unwrap();

    // Replaying a completed page adds record counts only
    let job = repo
        .record_page(job.id, lease, 1, &PageOutcome {
            succeeded: true,
            skipped: 100,
            ..PageOutcome::default()
        })
        .await
        .unwrap();
    assert_eq!(job.completed_pages, 2);
    assert_eq!(job.skipped_count, 100);
    assert_eq!(job.current_page, 3);

    // Failing again does not grow the failed list
    let job = repo
        .record_page(job.id, lease, 2, &failed_page(2))
        .await
        .unwrap();
    assert_eq!(job.failed_pages, 1);
    assert_eq!(job.failed_page_list(), vec![2]);

    // A successful replay moves the page across
    let job = repo.record_page(job.id, lease, 2, &ok_page(100)).await.unwrap();
    assert_eq!(job.completed_pages, 3);
    assert_eq!(job.failed_pages, 0);
    assert!(job.failed_page_numbers.is_none());
    assert_eq!(job.new_count, 250);
    assert!(job.completed_pages + job.failed_pages <= job.total_pages);
}

#[tokio::test]
async fn completion_requires_the_lease_and_in_progress() {
    let (repo, job) = repo_with_job(1).await;
    let lease = Uuid::new_v4();
    repo.claim(job.id, lease, lease_expiry()).await.unwrap();

    assert!(!repo.mark_completed(job.id, Uuid::new_v4()).await.unwrap());
    assert!(repo.mark_completed(job.id, lease).await.unwrap());

    let job = repo.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
    assert!(job.lease_id.is_none());

    let err = repo
        .claim(job.id, Uuid::new_v4(), lease_expiry())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::JobFinished {
            status: JobStatus::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn paused_job_cannot_be_completed_by_a_stale_batch() {
    let (repo, job) = repo_with_job(1).await;
    let lease = Uuid::new_v4();
    repo.claim(job.id, lease, lease_expiry()).await.unwrap();

    let paused = repo.pause(job.id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert!(!repo.mark_completed(job.id, lease).await.unwrap());

    // Idempotent
    assert_eq!(repo.pause(job.id).await.unwrap().status, JobStatus::Paused);
}

#[tokio::test]
async fn terminal_jobs_reject_transitions() {
    let (repo, job) = repo_with_job(1).await;

    assert!(repo.mark_failed(job.id, "credentials revoked").await.unwrap());
    let failed = repo.get(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("credentials revoked"));

    assert!(!repo.mark_failed(job.id, "again").await.unwrap());
    assert!(matches!(
        repo.pause(job.id).await,
        Err(SyncError::JobFinished { .. })
    ));
    assert!(matches!(
        repo.cancel(job.id).await,
        Err(SyncError::JobFinished { .. })
    ));
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let (repo, job) = repo_with_job(1).await;

    let cancelled = repo.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    assert_eq!(repo.cancel(job.id).await.unwrap().status, JobStatus::Cancelled);
}
