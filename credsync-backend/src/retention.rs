use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Error;
use tracing::{info, warn};

use crate::audit::AuditStore;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;
const SIZE_PURGE_BATCH: u32 = 100;

/// Outcome of one [`RetentionPurger::run`] invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PurgeOutcome {
    pub skipped: bool,
    pub ttl_deleted: u64,
    pub size_deleted: u64,
    pub vacuumed: bool,
}

/// Enforces the TTL and size budgets of the retention policy. A single
/// atomic flag prevents the scheduled interval and the post-batch trigger
/// from overlapping; a second invocation while one is running returns
/// immediately with `skipped = true`.
pub struct RetentionPurger<S> {
    store: Arc<S>,
    running: AtomicBool,
}

impl<S> RetentionPurger<S>
where
    S: AuditStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            running: AtomicBool::new(false),
        }
    }

    /// Runs a TTL purge followed by a size purge, then a best-effort
    /// vacuum. `source` is a label for logging only; `"post-batch"` is
    /// one caller.
    pub async fn run(&self, source: &str) -> Result<PurgeOutcome, Error> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Ok(PurgeOutcome {
                skipped: true,
                ..Default::default()
            });
        }

        let result = self.run_locked(source).await;
        self.running.store(false, Ordering::Release);
        result
    }

    async fn run_locked(&self, source: &str) -> Result<PurgeOutcome, Error> {
        let now = now_millis();
        let policy = self.store.get_retention().await?;

        let ttl_deleted = self.purge_ttl(&policy, now).await?;
        let size_deleted = self.purge_by_size(&policy).await?;

        let bytes = self.store.approx_db_bytes().await?;
        self.store.set_approx_db_bytes(bytes, now_millis()).await?;

        let vacuumed = if ttl_deleted > 0 || size_deleted > 0 {
            match self.store.vacuum().await {
                Ok(()) => true,
                Err(err) => {
                    warn!(%err, "vacuum failed after retention purge");
                    false
                }
            }
        } else {
            false
        };

        info!(
            source,
            ttl_deleted, size_deleted, vacuumed, "retention purge complete"
        );

        Ok(PurgeOutcome {
            skipped: false,
            ttl_deleted,
            size_deleted,
            vacuumed,
        })
    }

    async fn purge_ttl(
        &self,
        policy: &credsync_core::audit::RetentionPolicy,
        now_millis: i64,
    ) -> Result<u64, Error> {
        let Some(max_age_days) = policy.max_age_days else {
            return Ok(0);
        };
        let cutoff = now_millis - max_age_days * MILLIS_PER_DAY;
        let deleted = self.store.delete_operations_before(cutoff).await?;
        self.store.delete_orphaned_batches_before(cutoff).await?;
        Ok(deleted)
    }

    async fn purge_by_size(
        &self,
        policy: &credsync_core::audit::RetentionPolicy,
    ) -> Result<u64, Error> {
        let Some(max_bytes) = policy.max_bytes else {
            return Ok(0);
        };

        let mut total_deleted = 0u64;
        loop {
            let current_bytes = self.store.approx_db_bytes().await?;
            if current_bytes <= max_bytes {
                break;
            }
            let deleted = self.store.delete_oldest_operations(SIZE_PURGE_BATCH).await?;
            total_deleted += deleted;
            if deleted == 0 {
                break;
            }
        }
        Ok(total_deleted)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audit::SqliteAuditStore;
    use credsync_core::audit::{BatchSource, OpResult, OpType, OperationRecord};
    use credsync_core::verifier::ScramMechanism;

    fn sample_op(occurred_at: i64) -> OperationRecord {
        OperationRecord {
            id: None,
            correlation_id: "corr".into(),
            occurred_at_millis: occurred_at,
            realm: "default".into(),
            cluster_id: "cluster-1".into(),
            principal: "alice".into(),
            op_type: OpType::ScramUpsert,
            mechanism: Some(ScramMechanism::Sha256),
            result: OpResult::Success,
            error_code: None,
            error_message: None,
            duration_ms: 5,
        }
    }

    #[tokio::test]
    async fn ttl_purge_removes_only_rows_past_cutoff() {
        let store = Arc::new(SqliteAuditStore::in_memory().await.unwrap());
        let batch_id = store.create_batch("corr", BatchSource::Scheduled).await.unwrap();

        let now = now_millis();
        let ten_days_ago = now - 10 * MILLIS_PER_DAY;
        let forty_days_ago = now - 40 * MILLIS_PER_DAY;
        store.record_operation(batch_id, sample_op(ten_days_ago)).await.unwrap();
        store.record_operation(batch_id, sample_op(forty_days_ago)).await.unwrap();

        store.update_retention(None, Some(30), now).await.unwrap();

        let purger = RetentionPurger::new(store.clone());
        let outcome = purger.run("test").await.unwrap();
        assert_eq!(outcome.ttl_deleted, 1);

        let remaining = store
            .list_operations(&crate::audit::OperationFilter::default(), crate::audit::Page { page: 1, page_size: 10 })
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn overlapping_runs_report_skipped() {
        let store = Arc::new(SqliteAuditStore::in_memory().await.unwrap());
        let purger = Arc::new(RetentionPurger::new(store));

        purger.running.store(true, Ordering::Release);
        let outcome = purger.run("test").await.unwrap();
        assert!(outcome.skipped);
    }

    #[tokio::test]
    async fn no_limits_is_a_no_op() {
        let store = Arc::new(SqliteAuditStore::in_memory().await.unwrap());
        let purger = RetentionPurger::new(store);
        let outcome = purger.run("test").await.unwrap();
        assert_eq!(outcome.ttl_deleted, 0);
        assert_eq!(outcome.size_deleted, 0);
    }
}
