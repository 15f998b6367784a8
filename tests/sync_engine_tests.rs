//! End-to-end engine tests: controller + fetcher + merge + writer against a wiremock
//! marketplace and an in-memory SQLite store.

mod test_utils;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use marketplace_sync::config::AppConfig;
use marketplace_sync::marketplace::MarketplaceClient;
use marketplace_sync::models::execution_log::{self, ExecutionStatus};
use marketplace_sync::models::stored_entity;
use marketplace_sync::models::sync_job::JobStatus;
use marketplace_sync::repositories::stored_entity::{EntitySnapshot, EntityStore, WriteOp};
use marketplace_sync::repositories::{SeaOrmEntityStore, SyncJobRepository};
use marketplace_sync::sync::identity::CandidateKeys;
use marketplace_sync::sync::{
    BatchResult, ControllerSettings, ExecuteParams, FieldPolicy, InitializeParams,
    PaginatedFetcher, SyncController, SyncError,
};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::json;
use test_utils::{RESOURCE_PATH, catalogue, controller, mount_catalogue, setup_test_db, test_config};
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn assert_counts_balance(result: &BatchResult) {
    assert_eq!(
        result.new + result.updated + result.skipped + result.errors,
        result.records_processed,
        "counts must add up to records processed: {result:?}"
    );
}

async fn initialize(controller: &SyncController, page_size: u32, batch_size: u32) -> Uuid {
    controller
        .initialize(InitializeParams {
            page_size: Some(page_size),
            batch_size: Some(batch_size),
            ..InitializeParams::default()
        })
        .await
        .unwrap()
        .job_id
}

async fn execute(controller: &SyncController, job_id: Uuid, batch_size: u32) -> BatchResult {
    controller
        .execute(ExecuteParams {
            batch_size: Some(batch_size),
            ..ExecuteParams::manual(job_id)
        })
        .await
        .unwrap()
}

async fn stored_count(db: &DatabaseConnection) -> u64 {
    stored_entity::Entity::find().count(db).await.unwrap()
}

#[tokio::test]
async fn full_sync_runs_across_invocations() {
    let server = MockServer::start().await;
    mount_catalogue(&server, catalogue(250), None).await;
    let db = setup_test_db().await.unwrap();
    let controller = controller(&db, &test_config(&server));

    let init = controller
        .initialize(InitializeParams {
            page_size: Some(100),
            ..InitializeParams::default()
        })
        .await
        .unwrap();
    assert_eq!(init.total_pages, 3);
    assert_eq!(init.total_records, 250);

    let first = execute(&controller, init.job_id, 2).await;
    assert_eq!((first.start_page, first.end_page), (1, 2));
    assert_eq!(first.new, 200);
    assert_eq!(first.status, JobStatus::InProgress);
    assert!(first.has_more);
    assert_eq!(first.next_page, Some(3));
    assert_counts_balance(&first);

    let second = execute(&controller, init.job_id, 2).await;
    assert_eq!((second.start_page, second.end_page), (3, 3));
    assert_eq!(second.new, 50);
    assert_eq!(second.status, JobStatus::Completed);
    assert!(!second.has_more);
    assert_counts_balance(&second);

    let status = controller.status(init.job_id).await.unwrap();
    assert_eq!(status.completed_pages, 3);
    assert_eq!(status.failed_pages, 0);
    assert_eq!(status.current_page, 3);
    assert_eq!(status.progress_percentage, 100.0);
    assert_eq!(status.counts.new, 250);
    assert!(!status.is_running);
    assert_eq!(stored_count(&db).await, 250);

    let err = controller
        .execute(ExecuteParams::manual(init.job_id))
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
async fn resync_updates_only_changed_records_and_keeps_derived_fields() {
    let server = MockServer::start().await;
    let records = mount_catalogue(&server, catalogue(250), None).await;
    let db = setup_test_db().await.unwrap();
    let controller = controller(&db, &test_config(&server));

    let job_id = initialize(&controller, 100, 3).await;
    execute(&controller, job_id, 3).await;

    let derived = json!({"profit_margin": 0.42, "opportunity_score": 87});
    stored_entity::Entity::update_many()
        .col_expr(stored_entity::Column::Derived, Expr::value(derived.clone()))
        .exec(&db)
        .await
        .unwrap();

    records.lock().unwrap()[41]["price"] = json!(999.99);

    let job_id = initialize(&controller, 100, 3).await;
    let result = execute(&controller, job_id, 3).await;

    assert_eq!(result.new, 0);
    assert_eq!(result.updated, 1);
    assert_eq!(result.skipped, 249);
    assert_counts_balance(&result);

    let rows = stored_entity::Entity::find().all(&db).await.unwrap();
    assert_eq!(rows.len(), 250);
    assert!(rows.iter().all(|row| row.derived.as_ref() == Some(&derived)));

    let changed = rows
        .iter()
        .find(|row| row.identity_key == "item:42")
        .unwrap();
    assert_eq!(changed.attributes["price"], json!(999.99));
    assert!(changed.last_updated_at.is_some());
    assert!(
        rows.iter()
            .filter(|row| row.identity_key != "item:42")
            .all(|row| row.last_updated_at.is_none())
    );
}

#[tokio::test]
async fn replaying_a_page_is_idempotent() {
    let server = MockServer::start().await;
    mount_catalogue(&server, catalogue(250), None).await;
    let db = setup_test_db().await.unwrap();
    let controller = controller(&db, &test_config(&server));

    let job_id = initialize(&controller, 100, 2).await;
    execute(&controller, job_id, 2).await;
    let before: Vec<_> = stored_entity::Entity::find().all(&db).await.unwrap();

    let replay = controller
        .execute(ExecuteParams {
            batch_size: Some(1),
            page_start: Some(1),
            ..ExecuteParams::manual(job_id)
        })
        .await
        .unwrap();

    assert_eq!(replay.new, 0);
    assert_eq!(replay.skipped, 100);
    assert_counts_balance(&replay);
    assert!(replay.has_more);
    assert_eq!(replay.next_page, Some(3), "resume point stays at the cursor");

    let status = controller.status(job_id).await.unwrap();
    assert_eq!(status.completed_pages, 2);
    assert_eq!(status.current_page, 2, "current page never moves backwards");
    assert_eq!(status.counts.new, 200);

    let after: Vec<_> = stored_entity::Entity::find().all(&db).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn rate_limited_page_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .and(query_param("page_number", "2"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_catalogue(&server, catalogue(250), None).await;
    let db = setup_test_db().await.unwrap();
    let controller = controller(&db, &test_config(&server));

    let job_id = initialize(&controller, 100, 3).await;
    let result = execute(&controller, job_id, 3).await;

    assert_eq!(result.pages_failed, 0);
    assert_eq!(result.new, 250);
    assert_eq!(result.status, JobStatus::Completed);
}

#[tokio::test]
async fn exhausted_rate_limit_fails_the_page_and_moves_on() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .and(query_param("page_number", "2"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .with_priority(1)
        .mount(&server)
        .await;
    mount_catalogue(&server, catalogue(250), None).await;
    let db = setup_test_db().await.unwrap();
    let controller = controller(&db, &test_config(&server));

    let job_id = initialize(&controller, 100, 3).await;
    let result = execute(&controller, job_id, 3).await;

    assert_eq!(result.pages_completed, 2);
    assert_eq!(result.pages_failed, 1);
    assert_eq!(result.new, 150);
    assert_counts_balance(&result);

    let status = controller.status(job_id).await.unwrap();
    assert_eq!(status.failed_pages, 1);
    assert_eq!(status.failed_page_numbers, vec![2]);
    assert_eq!(status.current_page, 3);
    assert!(status.last_error.unwrap().contains("page 2"));
    assert!(status.completed_pages + status.failed_pages <= status.total_pages);

    // 1 initial attempt + 2 retries on page 2
    let page_two_hits = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.query().is_some_and(|q| q.contains("page_number=2")))
        .count();
    assert_eq!(page_two_hits, 3);
}

#[tokio::test]
async fn replaying_a_failed_page_moves_it_to_completed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .and(query_param("page_number", "2"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_catalogue(&server, catalogue(300), None).await;
    let db = setup_test_db().await.unwrap();
    let controller = controller(&db, &test_config(&server));

    let job_id = initialize(&controller, 100, 2).await;
    let first = execute(&controller, job_id, 2).await;
    assert_eq!(first.pages_failed, 1);

    let replay = controller
        .execute(ExecuteParams {
            batch_size: Some(1),
            page_start: Some(2),
            ..ExecuteParams::manual(job_id)
        })
        .await
        .unwrap();
    assert_eq!(replay.pages_completed, 1);
    assert_eq!(replay.new, 100);

    let status = controller.status(job_id).await.unwrap();
    assert_eq!(status.completed_pages, 2);
    assert_eq!(status.failed_pages, 0);
    assert!(status.failed_page_numbers.is_empty());
    assert_eq!(status.current_page, 2);
}

#[tokio::test]
async fn auth_failure_fails_the_job_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .and(query_param("page_size", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"itemId": 1}],
            "pagination": {"total_count": 300}
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .with_priority(5)
        .mount(&server)
        .await;
    let db = setup_test_db().await.unwrap();
    let controller = controller(&db, &test_config(&server));

    let job_id = initialize(&controller, 100, 3).await;
    let err = controller
        .execute(ExecuteParams::manual(job_id))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Auth { status: 401, .. }));

    let status = controller.status(job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    assert!(!status.is_running);
    assert!(status.last_error.unwrap().contains("401"));

    // Probe plus a single page 1 attempt; pages 2 and 3 are never requested
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    let log = execution_log::Entity::find().one(&db).await.unwrap().unwrap();
    assert_eq!(log.status, ExecutionStatus::Failure);
    assert!(log.end_time.is_some());
}

#[tokio::test]
async fn concurrent_execute_calls_are_rejected() {
    let server = MockServer::start().await;
    mount_catalogue(&server, catalogue(300), Some(Duration::from_millis(200))).await;
    let db = setup_test_db().await.unwrap();
    let controller = controller(&db, &test_config(&server));
    let job_id = initialize(&controller, 100, 2).await;

    let (a, b) = tokio::join!(
        controller.execute(ExecuteParams {
            batch_size: Some(2),
            ..ExecuteParams::manual(job_id)
        }),
        controller.execute(ExecuteParams {
            batch_size: Some(2),
            ..ExecuteParams::manual(job_id)
        }),
    );

    let (ok, err) = match (a, b) {
        (Ok(ok), Err(err)) | (Err(err), Ok(ok)) => (ok, err),
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    assert!(matches!(err, SyncError::ConcurrentExecution { .. }));
    assert_eq!(ok.pages_completed, 2);

    let status = controller.status(job_id).await.unwrap();
    assert_eq!(status.completed_pages, 2);
    assert_eq!(status.counts.new, 200);
    assert_eq!(stored_count(&db).await, 200);
}

#[tokio::test]
async fn unexpired_lease_blocks_and_expired_lease_is_taken_over() {
    let server = MockServer::start().await;
    mount_catalogue(&server, catalogue(100), None).await;
    let db = setup_test_db().await.unwrap();
    let controller = controller(&db, &test_config(&server));
    let job_id = initialize(&controller, 100, 1).await;

    let repo = SyncJobRepository::new(db.clone());
    let held = chrono::Utc::now() + chrono::Duration::minutes(5);
    repo.claim(job_id, Uuid::new_v4(), held.fixed_offset())
        .await
        .unwrap();

    let err = controller
        .execute(ExecuteParams::manual(job_id))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ConcurrentExecution { .. }));

    // A crashed invocation's lease expires
    let expired = chrono::Utc::now() - chrono::Duration::seconds(1);
    marketplace_sync::models::sync_job::Entity::update_many()
        .col_expr(
            marketplace_sync::models::sync_job::Column::LeaseExpiresAt,
            Expr::value(expired.fixed_offset()),
        )
        .exec(&db)
        .await
        .unwrap();

    let result = execute(&controller, job_id, 1).await;
    assert_eq!(result.status, JobStatus::Completed);
}

#[tokio::test]
async fn pause_stops_the_batch_and_resume_finishes_the_same_set() {
    let server = MockServer::start().await;
    mount_catalogue(&server, catalogue(250), Some(Duration::from_millis(300))).await;
    let db = setup_test_db().await.unwrap();
    let controller = controller(&db, &test_config(&server));
    let job_id = initialize(&controller, 100, 3).await;

    let (batch, paused) = tokio::join!(execute(&controller, job_id, 3), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.pause(job_id).await.unwrap()
    });

    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(batch.pages_completed, 1);
    assert_eq!(batch.stopped_reason, Some(JobStatus::Paused));
    assert_eq!(batch.status, JobStatus::Paused);
    assert!(batch.has_more);
    assert_eq!(batch.next_page, Some(2));

    let resumed = execute(&controller, job_id, 3).await;
    assert_eq!(resumed.start_page, 2);
    assert_eq!(resumed.status, JobStatus::Completed);

    let status = controller.status(job_id).await.unwrap();
    assert_eq!(status.counts.new, 250);
    assert_eq!(stored_count(&db).await, 250);

    let log = execution_log::Entity::find()
        .filter(execution_log::Column::Status.eq(ExecutionStatus::Cancelled))
        .count(&db)
        .await
        .unwrap();
    assert_eq!(log, 1);
}

#[tokio::test]
async fn cancelled_job_rejects_further_execution() {
    let server = MockServer::start().await;
    mount_catalogue(&server, catalogue(250), None).await;
    let db = setup_test_db().await.unwrap();
    let controller = controller(&db, &test_config(&server));
    let job_id = initialize(&controller, 100, 1).await;

    execute(&controller, job_id, 1).await;
    let cancelled = controller.cancel(job_id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    let err = controller
        .execute(ExecuteParams::manual(job_id))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::JobFinished {
            status: JobStatus::Cancelled,
            ..
        }
    ));

    let err = controller.pause(job_id).await.unwrap_err();
    assert!(matches!(err, SyncError::JobFinished { .. }));
}

#[tokio::test]
async fn timeout_leaves_the_job_resumable() {
    let server = MockServer::start().await;
    mount_catalogue(&server, catalogue(200), Some(Duration::from_millis(400))).await;
    let db = setup_test_db().await.unwrap();
    let config = test_config(&server);

    let mut settings = ControllerSettings::from_config(&config);
    settings.manual_timeout = Duration::from_millis(150);
    let client = MarketplaceClient::new(&config.marketplace).unwrap();
    let store = Arc::new(SeaOrmEntityStore::new(
        db.clone(),
        config.sync.store_collection.clone(),
        config.sync.write_batch_limit,
    ));
    let impatient = SyncController::new(
        db.clone(),
        PaginatedFetcher::new(Arc::new(client), config.fetch.clone()),
        store,
        FieldPolicy::from_config(&config.sync),
        settings,
    );

    let patient = controller(&db, &config);
    let job_id = initialize(&patient, 100, 2).await;

    let err = impatient
        .execute(ExecuteParams::manual(job_id))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Timeout { budget_ms: 150 }));

    let status = patient.status(job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::InProgress);
    assert!(!status.is_running, "lease is released on timeout");
    assert!(status.last_error.unwrap().contains("budget"));

    let log = execution_log::Entity::find().one(&db).await.unwrap().unwrap();
    assert_eq!(log.status, ExecutionStatus::Timeout);

    let result = execute(&patient, job_id, 2).await;
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(stored_count(&db).await, 200);
}

/// Store whose `fail_on`-th commit (0-based) fails.
struct FailingStore {
    inner: SeaOrmEntityStore,
    commits: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl EntityStore for FailingStore {
    async fn find_by_candidate_keys(
        &self,
        keys: &CandidateKeys,
    ) -> Result<Vec<EntitySnapshot>, SyncError> {
        self.inner.find_by_candidate_keys(keys).await
    }

    async fn commit_chunk(&self, ops: &[WriteOp]) -> Result<(), SyncError> {
        if self.commits.fetch_add(1, Ordering::SeqCst) == self.fail_on {
            return Err(SyncError::StorageWrite("injected chunk failure".into()));
        }
        self.inner.commit_chunk(ops).await
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }
}

#[tokio::test]
async fn failed_write_chunk_is_isolated() {
    let server = MockServer::start().await;
    mount_catalogue(&server, catalogue(200), None).await;
    let db = setup_test_db().await.unwrap();
    let mut config: AppConfig = test_config(&server);
    config.sync.write_batch_limit = 25;

    let store = Arc::new(FailingStore {
        inner: SeaOrmEntityStore::new(db.clone(), config.sync.store_collection.clone(), 25),
        commits: AtomicUsize::new(0),
        fail_on: 1,
    });
    let client = MarketplaceClient::new(&config.marketplace).unwrap();
    let controller = SyncController::new(
        db.clone(),
        PaginatedFetcher::new(Arc::new(client), config.fetch.clone()),
        store.clone(),
        FieldPolicy::from_config(&config.sync),
        ControllerSettings::from_config(&config),
    );

    let job_id = initialize(&controller, 100, 1).await;
    let result = execute(&controller, job_id, 1).await;

    assert_eq!(store.commits.load(Ordering::SeqCst), 4);
    assert_eq!(result.pages_completed, 1);
    assert_eq!(result.new, 75);
    assert_eq!(result.errors, 25);
    assert_counts_balance(&result);
    assert_eq!(stored_count(&db).await, 75);

    let status = controller.status(job_id).await.unwrap();
    assert_eq!(status.counts.errors, 25);
    assert!(status.last_error.unwrap().contains("injected chunk failure"));

    // Replaying the page writes only the lost chunk
    let replay = controller
        .execute(ExecuteParams {
            batch_size: Some(1),
            page_start: Some(1),
            ..ExecuteParams::manual(job_id)
        })
        .await
        .unwrap();
    assert_eq!(replay.new, 25);
    assert_eq!(replay.skipped, 75);
    assert_eq!(replay.errors, 0);
    assert_eq!(stored_count(&db).await, 100);
}

#[tokio::test]
async fn collection_is_stamped_on_every_entity() {
    let server = MockServer::start().await;
    mount_catalogue(&server, catalogue(10), None).await;
    let db = setup_test_db().await.unwrap();
    let mut config = test_config(&server);
    config.sync.store_collection = "marketplace_products_v2".to_string();
    let controller = controller(&db, &config);

    let job_id = initialize(&controller, 100, 1).await;
    execute(&controller, job_id, 1).await;

    let in_collection = stored_entity::Entity::find()
        .filter(stored_entity::Column::Collection.eq("marketplace_products_v2"))
        .count(&db)
        .await
        .unwrap();
    assert_eq!(in_collection, 10);
}

#[tokio::test]
async fn empty_catalogue_completes_on_first_execute() {
    let server = MockServer::start().await;
    mount_catalogue(&server, vec![], None).await;
    let db = setup_test_db().await.unwrap();
    let controller = controller(&db, &test_config(&server));

    let init = controller
        .initialize(InitializeParams::default())
        .await
        .unwrap();
    assert_eq!(init.total_pages, 0);

    let result = execute(&controller, init.job_id, 1).await;
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.pages_completed, 0);
    assert!(!result.has_more);
}
