//! Error taxonomy for the sync engine.
//!
//! Every failure carries an [`ErrorClass`] so the controller decides between aborting,
//! retrying, skipping a record or isolating a chunk by matching on the class instead of
//! inspecting messages.

use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

use crate::models::sync_job::JobStatus;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Marketplace rejected our credentials (401/403)
    #[error("marketplace rejected credentials (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    /// HTTP 429 that outlasted the retry budget
    #[error("marketplace rate limit still active after {attempts} attempts")]
    RateLimited {
        retry_after_secs: Option<u64>,
        attempts: u32,
    },

    /// Network failure or any other non-2xx response
    #[error("transient marketplace failure: {message}")]
    Transient { status: Option<u16>, message: String },

    #[error("unexpected data shape: {0}")]
    DataShape(String),

    #[error("store write failed: {0}")]
    StorageWrite(String),

    #[error("invocation exceeded its {budget_ms}ms budget")]
    Timeout { budget_ms: u64 },

    #[error("job {job_id} is already running")]
    ConcurrentExecution { job_id: Uuid },

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("job {job_id} is already {status}")]
    JobFinished { job_id: Uuid, status: JobStatus },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// How a caller must react to a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Abort the invocation and fail the job
    Fatal,
    /// Retry the same page within the fetch budget
    Retryable,
    /// Count the record as an error and keep going
    RecordSkip,
    /// Count the chunk's operations as errors and commit the next chunk
    ChunkIsolated,
    /// Abort the invocation; the job stays resumable
    Invocation,
    /// Caller asked for something impossible
    Caller,
}

impl SyncError {
    pub fn auth<S: Into<String>>(status: u16, message: S) -> Self {
        Self::Auth {
            status,
            message: message.into(),
        }
    }

    pub fn transient<S: Into<String>>(status: Option<u16>, message: S) -> Self {
        Self::Transient {
            status,
            message: message.into(),
        }
    }

    pub fn data_shape<S: Into<String>>(message: S) -> Self {
        Self::DataShape(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Auth { .. } => ErrorClass::Fatal,
            SyncError::RateLimited { .. } | SyncError::Transient { .. } => ErrorClass::Retryable,
            SyncError::DataShape(_) => ErrorClass::RecordSkip,
            SyncError::StorageWrite(_) => ErrorClass::ChunkIsolated,
            SyncError::Timeout { .. } | SyncError::Storage(_) => ErrorClass::Invocation,
            SyncError::ConcurrentExecution { .. }
            | SyncError::JobNotFound(_)
            | SyncError::JobFinished { .. }
            | SyncError::InvalidRequest(_) => ErrorClass::Caller,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Upstream HTTP status, when the error came from a marketplace response.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            SyncError::Auth { status, .. } => Some(*status),
            SyncError::RateLimited { .. } => Some(429),
            SyncError::Transient { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<DbErr> for SyncError {
    fn from(error: DbErr) -> Self {
        SyncError::Storage(error.to_string())
    }
}
