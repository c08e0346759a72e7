use anyhow::Error;

use credsync_core::audit::{BatchRecord, BatchSource, OpResult, OpType, OperationRecord, RetentionPolicy};

pub use self::sqlite::SqliteAuditStore;

mod sqlite;

/// Filters accepted by [`AuditStore::list_operations`].
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub start_time_millis: Option<i64>,
    pub end_time_millis: Option<i64>,
    pub principal: Option<String>,
    pub op_type: Option<OpType>,
    pub result: Option<OpResult>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub fn offset(&self) -> i64 {
        (self.page.saturating_sub(1) as i64) * self.page_size as i64
    }

    pub fn limit(&self) -> i64 {
        self.page_size as i64
    }
}

/// Rolling one-hour summary served by `GET /api/summary`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RollingSummary {
    pub ops_per_hour: i64,
    pub error_rate: f64,
    pub p95_duration_ms: i64,
    pub p99_duration_ms: i64,
}

/// The append-only audit surface consumed by the Control API and written
/// by the Reconciliation Orchestrator. No generic ORM surface leaks past
/// this trait.
#[allow(async_fn_in_trait)]
pub trait AuditStore: Send + Sync {
    /// Inserts a new batch row and commits before any external I/O the
    /// caller goes on to do.
    async fn create_batch(&self, correlation_id: &str, source: BatchSource) -> Result<i64, Error>;

    /// Updates `items_total` once the diff plan is known.
    async fn set_batch_items_total(&self, batch_id: i64, items_total: i64) -> Result<(), Error>;

    /// Appends an operation row and updates the owning batch's counters in
    /// one transaction: no partial count is ever visible to readers.
    async fn record_operation(&self, batch_id: i64, operation: OperationRecord) -> Result<(), Error>;

    /// Marks a batch complete, recording final counters (already reflected
    /// incrementally by `record_operation`) and `finished_at`.
    async fn finish_batch(&self, batch_id: i64) -> Result<(), Error>;

    async fn get_batch(&self, correlation_id: &str) -> Result<Option<BatchRecord>, Error>;

    async fn list_operations(
        &self,
        filter: &OperationFilter,
        page: Page,
    ) -> Result<Vec<OperationRecord>, Error>;

    async fn list_batches(&self, page: Page) -> Result<Vec<BatchRecord>, Error>;

    async fn rolling_summary(&self, window_millis: i64, now_millis: i64) -> Result<RollingSummary, Error>;

    async fn get_retention(&self) -> Result<RetentionPolicy, Error>;

    async fn update_retention(
        &self,
        max_bytes: Option<i64>,
        max_age_days: Option<i64>,
        now_millis: i64,
    ) -> Result<RetentionPolicy, Error>;

    /// Deletes operations older than `cutoff_millis`; returns the count
    /// deleted. Part of the TTL purge.
    async fn delete_operations_before(&self, cutoff_millis: i64) -> Result<u64, Error>;

    /// Deletes batches finished before `cutoff_millis` that no longer have
    /// any operations referencing them. Second half of the TTL purge.
    async fn delete_orphaned_batches_before(&self, cutoff_millis: i64) -> Result<u64, Error>;

    /// Deletes the oldest `limit` operations by `occurred_at`, for the
    /// size-purge loop.
    async fn delete_oldest_operations(&self, limit: u32) -> Result<u64, Error>;

    /// Current on-disk size estimate via a platform primitive
    /// (`PRAGMA page_count * page_size` for SQLite).
    async fn approx_db_bytes(&self) -> Result<i64, Error>;

    /// Updates the retention row's `approx_db_bytes`/`updated_at` without
    /// touching the limits (the purger's own write).
    async fn set_approx_db_bytes(&self, bytes: i64, now_millis: i64) -> Result<(), Error>;

    /// Best-effort reclamation of freed pages. Must not run inside a
    /// transaction.
    async fn vacuum(&self) -> Result<(), Error>;
}
