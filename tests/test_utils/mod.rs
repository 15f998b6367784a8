//! Test utilities for database and marketplace testing.
//!
//! In-memory SQLite with migrations applied, plus a wiremock responder that serves a
//! mutable catalogue page by page the way the marketplace does.

use anyhow::Result;
use marketplace_sync::config::{AppConfig, FetchPolicyConfig};
use marketplace_sync::sync::SyncController;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const RESOURCE_PATH: &str = "/api/v1/products";

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// The pool is pinned to a single connection; every new SQLite memory connection
/// would otherwise open its own empty database.
#[allow(dead_code)]
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(options).await?;

    Migrator::up(&db, None).await?;

    Ok(db)
}

/// `count` records keyed by `itemId` 1..=count.
#[allow(dead_code)]
pub fn catalogue(count: usize) -> Vec<Value> {
    (1..=count)
        .map(|i| {
            json!({
                "itemId": i,
                "title": format!("Product {i}"),
                "price": 10.0 + i as f64,
                "stock": i % 7,
                "color": "black",
            })
        })
        .collect()
}

/// Serves `records` with `page_number`/`page_size` query parameters and a
/// `pagination.total_count` envelope.
#[derive(Clone)]
pub struct CatalogueResponder {
    pub records: Arc<Mutex<Vec<Value>>>,
    pub delay: Option<Duration>,
}

impl Respond for CatalogueResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut page_number = 1usize;
        let mut page_size = 100usize;
        for (key, value) in request.url.query_pairs() {
            match key.as_ref() {
                "page_number" => page_number = value.parse().unwrap_or(1),
                "page_size" => page_size = value.parse().unwrap_or(100),
                _ => {}
            }
        }

        let records = self.records.lock().unwrap();
        let start = (page_number.saturating_sub(1)) * page_size;
        let items: Vec<Value> = records.iter().skip(start).take(page_size).cloned().collect();

        let template = ResponseTemplate::new(200).set_body_json(json!({
            "items": items,
            "pagination": {
                "total_count": records.len(),
                "page_size": page_size,
                "page_number": page_number,
            }
        }));
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

/// Mount a catalogue of `records` on `server`; the returned handle mutates it live.
#[allow(dead_code)]
pub async fn mount_catalogue(
    server: &MockServer,
    records: Vec<Value>,
    delay: Option<Duration>,
) -> Arc<Mutex<Vec<Value>>> {
    let shared = Arc::new(Mutex::new(records));
    Mock::given(method("GET"))
        .and(path(RESOURCE_PATH))
        .respond_with(CatalogueResponder {
            records: shared.clone(),
            delay,
        })
        .with_priority(10)
        .mount(server)
        .await;
    shared
}

/// Configuration pointed at `server` with retry and pacing delays shrunk for tests.
#[allow(dead_code)]
pub fn test_config(server: &MockServer) -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        ..AppConfig::default()
    };
    config.marketplace.api_base = format!("{}/api/v1", server.uri());
    config.marketplace.api_key = Some("test-key".to_string());
    config.marketplace.request_timeout_secs = 5;
    config.fetch = FetchPolicyConfig {
        max_retries: 2,
        rate_limit_delay_ms: 10,
        backoff_base_ms: 5,
        backoff_max_ms: 20,
        jitter_factor: 0.0,
        page_delay_ms: 0,
    };
    config
}

#[allow(dead_code)]
pub fn controller(db: &DatabaseConnection, config: &AppConfig) -> SyncController {
    SyncController::from_config(db.clone(), config).unwrap()
}
