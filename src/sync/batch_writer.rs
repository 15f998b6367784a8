//! Chunked writes with per-chunk failure isolation.

use std::sync::Arc;

use metrics::counter;
use tracing::{instrument, warn};

use crate::repositories::stored_entity::{EntityStore, WriteOp};
use crate::telemetry::METRIC_WRITE_CHUNKS_FAILED;

/// Outcome of flushing one page's write plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub inserted: u64,
    pub updated: u64,
    /// Operations lost to failed chunks
    pub failed: u64,
    pub chunks_committed: u32,
    pub chunks_failed: u32,
    pub last_error: Option<String>,
}

pub struct BatchWriter {
    store: Arc<dyn EntityStore>,
    chunk_size: usize,
}

impl BatchWriter {
    /// `limit` is clamped to what the store accepts per call.
    pub fn new(store: Arc<dyn EntityStore>, limit: usize) -> Self {
        let chunk_size = limit.min(store.max_batch_size()).max(1);
        Self { store, chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Commit `ops` chunk by chunk. A failed chunk never stops later chunks.
    #[instrument(skip(self, ops), fields(ops = ops.len(), chunk_size = self.chunk_size))]
    pub async fn flush(&self, ops: &[WriteOp]) -> WriteSummary {
        let mut summary = WriteSummary::default();

        for (index, chunk) in ops.chunks(self.chunk_size).enumerate() {
            match self.store.commit_chunk(chunk).await {
                Ok(()) => {
                    summary.chunks_committed += 1;
                    for op in chunk {
                        match op {
                            WriteOp::Insert(_) => summary.inserted += 1,
                            WriteOp::Update(_) => summary.updated += 1,
                        }
                    }
                }
                Err(e) => {
                    warn!(chunk = index, size = chunk.len(), "write chunk failed: {}", e);
                    counter!(METRIC_WRITE_CHUNKS_FAILED).increment(1);
                    summary.chunks_failed += 1;
                    summary.failed += chunk.len() as u64;
                    summary.last_error = Some(e.to_string());
                }
            }
        }

        summary
    }
}
