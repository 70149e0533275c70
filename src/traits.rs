use async_trait::async_trait;

use crate::error::Result;
use crate::models::{CanonicalRow, RunEvent, Source};

/// Read-only list of pages to ingest.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    async fn list_sources(&self) -> Result<Vec<Source>>;
}

/// Bulk sink for canonical rows. No dedup happens at this layer.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn store_rows(
        &self,
        source_filename: &str,
        participant_count: i64,
        rows: &[CanonicalRow],
    ) -> Result<usize>;
}

/// Append-only sink for run events.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, event: &RunEvent) -> Result<()>;
}

/// Idempotency gate keyed by archive entry filename.
#[async_trait]
pub trait DedupTracker: Send + Sync {
    async fn is_processed(&self, filename: &str) -> Result<bool>;

    /// Marking an already-marked filename is a no-op.
    async fn mark_processed(&self, filename: &str) -> Result<()>;
}
