//! # Sync Engine
//!
//! Fetcher -> identity resolver -> merge engine -> batch writer, driven one bounded
//! batch at a time by the [`SyncController`], with every invocation recorded by the
//! [`ExecutionLogger`].

pub mod batch_writer;
pub mod controller;
pub mod error;
pub mod execution_logger;
pub mod fetcher;
pub mod identity;
pub mod merge;

pub use batch_writer::{BatchWriter, WriteSummary};
pub use controller::{
    BatchResult, ControllerSettings, ExecuteParams, InitializeParams, InitializeResult,
    JobCounts, JobProgress, SyncController,
};
pub use error::{ErrorClass, SyncError};
pub use execution_logger::{
    ExecutionFilter, ExecutionLogger, ExecutionMetrics, ExecutionPage, ExecutionStart,
};
pub use fetcher::PaginatedFetcher;
pub use merge::{FieldPolicy, MergeEngine, PageMerge};
