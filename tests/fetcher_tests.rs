//! Fetcher tests against a wiremock marketplace: retry classification, pacing and
//! response shape handling.

mod test_utils;

use std::sync::Arc;
use std::time::{Duration, Instant};

use marketplace_sync::config::AppConfig;
use marketplace_sync::marketplace::MarketplaceClient;
use marketplace_sync::sync::{PaginatedFetcher, SyncError};
use serde_json::json;
use test_utils::{RESOURCE_PATH, test_config};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher(config: &AppConfig) -> PaginatedFetcher {
    let client = MarketplaceClient::new(&config.marketplace).expect("client");
    PaginatedFetcher::new(Arc::new(client), config.fetch.clone())
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap().len()
}

#[tokio::test]
async fn sends_page_query_and_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .and(query_param("page_number", "3"))
        .and(query_param("page_size", "50"))
        .and(header("X-API-Key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"itemId": 1}, {"itemId": 2}],
            "pagination": {"total_count": 102, "page_size": 50}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = fetcher(&test_config(&server))
        .fetch_page(3, 50)
        .await
        .unwrap();

    assert_eq!(page.items.len(), 2);
    assert_eq!(page.total_count, Some(102));
    assert_eq!(page.page_size, Some(50));
}

#[tokio::test]
async fn probe_requests_a_single_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .and(query_param("page_number", "1"))
        .and(query_param("page_size", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"itemId": 1}],
            "totalCount": "4213"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = fetcher(&test_config(&server)).probe().await.unwrap();
    assert_eq!(page.total_count, Some(4213));
}

#[tokio::test]
async fn honours_retry_after_on_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .mount(&server)
        .await;

    let started = Instant::now();
    let page = fetcher(&test_config(&server))
        .fetch_page(1, 10)
        .await
        .unwrap();

    assert!(page.items.is_empty());
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn persistent_rate_limit_reports_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let err = fetcher(&test_config(&server))
        .fetch_page(1, 10)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::RateLimited { attempts: 3, .. }));
    assert!(err.is_retryable());
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn server_errors_back_off_and_recover() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [{"sku": "A"}]})))
        .mount(&server)
        .await;

    let page = fetcher(&test_config(&server))
        .fetch_page(1, 10)
        .await
        .unwrap();

    assert_eq!(page.items.len(), 1);
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn exhausted_server_errors_keep_the_upstream_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = fetcher(&test_config(&server))
        .fetch_page(1, 10)
        .await
        .unwrap_err();

    assert_eq!(err.upstream_status(), Some(503));
    assert!(!err.is_fatal());
    assert!(err.to_string().contains("maintenance"));
}

#[tokio::test]
async fn auth_failures_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let err = fetcher(&test_config(&server))
        .fetch_page(1, 10)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Auth { status: 403, .. }));
    assert!(err.is_fatal());
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn non_json_body_is_a_data_shape_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = fetcher(&test_config(&server))
        .fetch_page(1, 10)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::DataShape(_)));
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn alternative_envelopes_are_understood() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .and(query_param("page_number", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"items": [{"offerId": "o-1"}, {"offerId": "o-2"}]},
            "meta": {"total": 2}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .and(query_param("page_number", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"sku": "bare"}])))
        .mount(&server)
        .await;

    let fetcher = fetcher(&test_config(&server));

    let nested = fetcher.fetch_page(1, 10).await.unwrap();
    assert_eq!(nested.items.len(), 2);
    assert_eq!(nested.total_count, Some(2));

    let bare = fetcher.fetch_page(2, 10).await.unwrap();
    assert_eq!(bare.items, vec![json!({"sku": "bare"})]);
    assert_eq!(bare.total_count, None);
}

#[tokio::test]
async fn slow_responses_time_out_as_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"items": []}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.marketplace.request_timeout_secs = 1;
    config.fetch.max_retries = 0;

    let err = fetcher(&config).fetch_page(1, 10).await.unwrap_err();
    assert!(matches!(err, SyncError::Transient { status: None, .. }));
}
