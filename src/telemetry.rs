//! Telemetry bootstrap: global tracing subscriber, request-scoped trace context and
//! metric descriptions for the sync engine.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use metrics::{Unit, describe_counter, describe_histogram};
use thiserror::Error;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};
use uuid::Uuid;

use crate::config::AppConfig;

pub const METRIC_PAGES_TOTAL: &str = "sync_pages_total";
pub const METRIC_RECORDS_TOTAL: &str = "sync_records_total";
pub const METRIC_WRITE_CHUNKS_FAILED: &str = "sync_write_chunks_failed_total";
pub const METRIC_RATE_LIMIT_RETRIES: &str = "sync_rate_limit_retries_total";
pub const METRIC_PAGE_FETCH_SECONDS: &str = "sync_page_fetch_duration_seconds";

/// Request correlation id carried through a handler's task.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
}

impl TraceContext {
    /// Reuses a caller-supplied id when it looks sane, otherwise mints a new one.
    pub fn from_request_id(request_id: Option<&str>) -> Self {
        let trace_id = request_id
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.len() <= 128 && id.is_ascii())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self { trace_id }
    }
}

task_local! {
    static ACTIVE_TRACE_CONTEXT: TraceContext;
}

#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber once; `log::` records (sqlx, sea-orm) are bridged in.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        // Another LogTracer (tests, embedding binary) is fine
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: failed to install log tracer bridge: {}. `log::` records will not reach tracing.",
                err
            );
        }
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().with_current_span(true).boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!(
            "Warning: failed to set global tracing subscriber: {}. Default subscriber remains in effect.",
            err
        );
    }

    describe_metrics();

    Ok(())
}

/// Register units and help text for the engine's metrics with whatever recorder is installed.
pub fn describe_metrics() {
    describe_counter!(
        METRIC_PAGES_TOTAL,
        Unit::Count,
        "Pages processed by the sync engine, labelled by outcome"
    );
    describe_counter!(
        METRIC_RECORDS_TOTAL,
        Unit::Count,
        "Records processed, labelled new, updated, skipped or error"
    );
    describe_counter!(
        METRIC_WRITE_CHUNKS_FAILED,
        Unit::Count,
        "Store write chunks that failed to commit"
    );
    describe_counter!(
        METRIC_RATE_LIMIT_RETRIES,
        Unit::Count,
        "Page fetch retries caused by HTTP 429"
    );
    describe_histogram!(
        METRIC_PAGE_FETCH_SECONDS,
        Unit::Seconds,
        "Latency of a single marketplace page request"
    );
}

/// Run `future` with `context` visible through [`current_trace_id`].
pub async fn with_trace_context<Fut, R>(context: TraceContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_TRACE_CONTEXT.scope(context, future).await
}

pub fn current_trace_id() -> Option<String> {
    ACTIVE_TRACE_CONTEXT
        .try_with(|ctx| ctx.trace_id.clone())
        .ok()
}
