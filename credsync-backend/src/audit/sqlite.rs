use anyhow::{Context, Error};
use sqlx::{Pool, Row, Sqlite, sqlite::SqlitePoolOptions};

use credsync_core::audit::{
    BatchRecord, BatchSource, OpResult, OpType, OperationRecord, RetentionPolicy,
};
use credsync_core::verifier::ScramMechanism;

use crate::audit::{AuditStore, OperationFilter, Page, RollingSummary};
use crate::settings::Settings;

pub struct SqliteAuditStore {
    pool: Pool<Sqlite>,
}

impl SqliteAuditStore {
    pub async fn new(settings: &Settings) -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&settings.database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running audit store migrations")?;

        Ok(Self { pool })
    }

    /// An unmigrated-schema, ephemeral store for tests across this
    /// workspace — not gated behind `#[cfg(test)]` since downstream
    /// crates' own test suites (`credsync-reconcile`, `credsync-agent`)
    /// need it too, and a `cfg(test)` gate only applies to this crate's
    /// own test builds.
    pub async fn in_memory() -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

fn op_type_to_str(op_type: OpType) -> &'static str {
    match op_type {
        OpType::ScramUpsert => "SCRAM_UPSERT",
        OpType::ScramDelete => "SCRAM_DELETE",
    }
}

fn op_type_from_str(s: &str) -> Result<OpType, Error> {
    match s {
        "SCRAM_UPSERT" => Ok(OpType::ScramUpsert),
        "SCRAM_DELETE" => Ok(OpType::ScramDelete),
        other => Err(anyhow::anyhow!("unknown op_type `{other}`")),
    }
}

fn result_to_str(result: OpResult) -> &'static str {
    match result {
        OpResult::Success => "SUCCESS",
        OpResult::Error => "ERROR",
        OpResult::Skipped => "SKIPPED",
    }
}

fn result_from_str(s: &str) -> Result<OpResult, Error> {
    match s {
        "SUCCESS" => Ok(OpResult::Success),
        "ERROR" => Ok(OpResult::Error),
        "SKIPPED" => Ok(OpResult::Skipped),
        other => Err(anyhow::anyhow!("unknown result `{other}`")),
    }
}

fn source_to_str(source: BatchSource) -> &'static str {
    match source {
        BatchSource::Scheduled => "SCHEDULED",
        BatchSource::Manual => "MANUAL",
        BatchSource::Immediate => "IMMEDIATE",
    }
}

fn source_from_str(s: &str) -> Result<BatchSource, Error> {
    match s {
        "SCHEDULED" => Ok(BatchSource::Scheduled),
        "MANUAL" => Ok(BatchSource::Manual),
        "IMMEDIATE" => Ok(BatchSource::Immediate),
        other => Err(anyhow::anyhow!("unknown source `{other}`")),
    }
}

fn mechanism_to_str(mechanism: ScramMechanism) -> &'static str {
    match mechanism {
        ScramMechanism::Sha256 => "SCRAM-SHA-256",
        ScramMechanism::Sha512 => "SCRAM-SHA-512",
    }
}

fn mechanism_from_str(s: &str) -> Result<ScramMechanism, Error> {
    match s {
        "SCRAM-SHA-256" => Ok(ScramMechanism::Sha256),
        "SCRAM-SHA-512" => Ok(ScramMechanism::Sha512),
        other => Err(anyhow::anyhow!("unknown mechanism `{other}`")),
    }
}

fn row_to_operation(row: &sqlx::sqlite::SqliteRow) -> Result<OperationRecord, Error> {
    let mechanism: Option<String> = row.try_get("mechanism")?;
    Ok(OperationRecord {
        id: Some(row.try_get("id")?),
        correlation_id: row.try_get("correlation_id")?,
        occurred_at_millis: row.try_get("occurred_at")?,
        realm: row.try_get("realm")?,
        cluster_id: row.try_get("cluster_id")?,
        principal: row.try_get("principal")?,
        op_type: op_type_from_str(&row.try_get::<String, _>("op_type")?)?,
        mechanism: mechanism.map(|m| mechanism_from_str(&m)).transpose()?,
        result: result_from_str(&row.try_get::<String, _>("result")?)?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

fn row_to_batch(row: &sqlx::sqlite::SqliteRow) -> Result<BatchRecord, Error> {
    Ok(BatchRecord {
        id: Some(row.try_get("id")?),
        correlation_id: row.try_get("correlation_id")?,
        started_at_millis: row.try_get("started_at")?,
        finished_at_millis: row.try_get("finished_at")?,
        source: source_from_str(&row.try_get::<String, _>("source")?)?,
        items_total: row.try_get("items_total")?,
        items_success: row.try_get("items_success")?,
        items_error: row.try_get("items_error")?,
    })
}

impl AuditStore for SqliteAuditStore {
    async fn create_batch(&self, correlation_id: &str, source: BatchSource) -> Result<i64, Error> {
        let now = now_millis();
        let id = sqlx::query(
            r#"
            INSERT INTO sync_batch (correlation_id, started_at, source, items_total)
            VALUES (?, ?, ?, 0)
            "#,
        )
        .bind(correlation_id)
        .bind(now)
        .bind(source_to_str(source))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    async fn set_batch_items_total(&self, batch_id: i64, items_total: i64) -> Result<(), Error> {
        sqlx::query("UPDATE sync_batch SET items_total = ? WHERE id = ?")
            .bind(items_total)
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_operation(&self, batch_id: i64, operation: OperationRecord) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sync_operation
                (correlation_id, occurred_at, realm, cluster_id, principal, op_type, mechanism, result, error_code, error_message, duration_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&operation.correlation_id)
        .bind(operation.occurred_at_millis)
        .bind(&operation.realm)
        .bind(&operation.cluster_id)
        .bind(&operation.principal)
        .bind(op_type_to_str(operation.op_type))
        .bind(operation.mechanism.map(mechanism_to_str))
        .bind(result_to_str(operation.result))
        .bind(&operation.error_code)
        .bind(&operation.error_message)
        .bind(operation.duration_ms)
        .execute(&mut *tx)
        .await?;

        let counter_column = match operation.result {
            OpResult::Success | OpResult::Skipped => "items_success",
            OpResult::Error => "items_error",
        };
        let update_sql = format!("UPDATE sync_batch SET {counter_column} = {counter_column} + 1 WHERE id = ?");
        sqlx::query(&update_sql)
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn finish_batch(&self, batch_id: i64) -> Result<(), Error> {
        sqlx::query("UPDATE sync_batch SET finished_at = ? WHERE id = ?")
            .bind(now_millis())
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_batch(&self, correlation_id: &str) -> Result<Option<BatchRecord>, Error> {
        let row = sqlx::query("SELECT * FROM sync_batch WHERE correlation_id = ?")
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_batch).transpose()
    }

    async fn list_operations(
        &self,
        filter: &OperationFilter,
        page: Page,
    ) -> Result<Vec<OperationRecord>, Error> {
        let mut sql = String::from("SELECT * FROM sync_operation WHERE 1 = 1");
        if filter.start_time_millis.is_some() {
            sql.push_str(" AND occurred_at >= ?");
        }
        if filter.end_time_millis.is_some() {
            sql.push_str(" AND occurred_at <= ?");
        }
        if filter.principal.is_some() {
            sql.push_str(" AND principal = ?");
        }
        if filter.op_type.is_some() {
            sql.push_str(" AND op_type = ?");
        }
        if filter.result.is_some() {
            sql.push_str(" AND result = ?");
        }
        sql.push_str(" ORDER BY occurred_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(start) = filter.start_time_millis {
            query = query.bind(start);
        }
        if let Some(end) = filter.end_time_millis {
            query = query.bind(end);
        }
        if let Some(principal) = &filter.principal {
            query = query.bind(principal.clone());
        }
        if let Some(op_type) = filter.op_type {
            query = query.bind(op_type_to_str(op_type));
        }
        if let Some(result) = filter.result {
            query = query.bind(result_to_str(result));
        }
        query = query.bind(page.limit()).bind(page.offset());

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_operation).collect()
    }

    async fn list_batches(&self, page: Page) -> Result<Vec<BatchRecord>, Error> {
        let rows = sqlx::query("SELECT * FROM sync_batch ORDER BY started_at DESC LIMIT ? OFFSET ?")
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_batch).collect()
    }

    async fn rolling_summary(&self, window_millis: i64, now_millis: i64) -> Result<RollingSummary, Error> {
        let cutoff = now_millis - window_millis;

        let mut durations: Vec<i64> = sqlx::query("SELECT duration_ms FROM sync_operation WHERE occurred_at >= ? ORDER BY duration_ms ASC")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.try_get::<i64, _>("duration_ms"))
            .collect::<Result<_, _>>()?;

        let total = durations.len() as i64;
        if total == 0 {
            return Ok(RollingSummary::default());
        }

        let errors: i64 = sqlx::query("SELECT COUNT(*) AS c FROM sync_operation WHERE occurred_at >= ? AND result = 'ERROR'")
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await?
            .try_get("c")?;

        durations.sort_unstable();
        let percentile = |p: f64| -> i64 {
            let idx = ((p * (durations.len() as f64 - 1.0)).round()) as usize;
            durations[idx.min(durations.len() - 1)]
        };

        Ok(RollingSummary {
            ops_per_hour: total,
            error_rate: errors as f64 / total as f64,
            p95_duration_ms: percentile(0.95),
            p99_duration_ms: percentile(0.99),
        })
    }

    async fn get_retention(&self) -> Result<RetentionPolicy, Error> {
        let row = sqlx::query("SELECT * FROM retention_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(RetentionPolicy {
            max_bytes: row.try_get("max_bytes")?,
            max_age_days: row.try_get("max_age_days")?,
            approx_db_bytes: row.try_get("approx_db_bytes")?,
            updated_at_millis: row.try_get("updated_at")?,
        })
    }

    async fn update_retention(
        &self,
        max_bytes: Option<i64>,
        max_age_days: Option<i64>,
        now_millis: i64,
    ) -> Result<RetentionPolicy, Error> {
        sqlx::query(
            "UPDATE retention_state SET max_bytes = ?, max_age_days = ?, updated_at = ? WHERE id = 1",
        )
        .bind(max_bytes)
        .bind(max_age_days)
        .bind(now_millis)
        .execute(&self.pool)
        .await?;
        self.get_retention().await
    }

    async fn delete_operations_before(&self, cutoff_millis: i64) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM sync_operation WHERE occurred_at < ?")
            .bind(cutoff_millis)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_orphaned_batches_before(&self, cutoff_millis: i64) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_batch
            WHERE finished_at IS NOT NULL
              AND finished_at < ?
              AND id NOT IN (SELECT DISTINCT sync_batch.id FROM sync_batch
                             JOIN sync_operation ON sync_operation.correlation_id = sync_batch.correlation_id)
            "#,
        )
        .bind(cutoff_millis)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_oldest_operations(&self, limit: u32) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_operation
            WHERE id IN (SELECT id FROM sync_operation ORDER BY occurred_at ASC LIMIT ?)
            "#,
        )
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn approx_db_bytes(&self) -> Result<i64, Error> {
        let page_count: i64 = sqlx::query("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        let page_size: i64 = sqlx::query("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        Ok(page_count * page_size)
    }

    async fn set_approx_db_bytes(&self, bytes: i64, now_millis: i64) -> Result<(), Error> {
        sqlx::query("UPDATE retention_state SET approx_db_bytes = ?, updated_at = ? WHERE id = 1")
            .bind(bytes)
            .bind(now_millis)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn vacuum(&self) -> Result<(), Error> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod test {
    use super::*;
    use credsync_core::audit::OperationRecord;

    fn sample_op(correlation_id: &str, result: OpResult, occurred_at: i64) -> OperationRecord {
        OperationRecord {
            id: None,
            correlation_id: correlation_id.to_string(),
            occurred_at_millis: occurred_at,
            realm: "default".into(),
            cluster_id: "cluster-1".into(),
            principal: "alice".into(),
            op_type: OpType::ScramUpsert,
            mechanism: Some(ScramMechanism::Sha256),
            result,
            error_code: None,
            error_message: None,
            duration_ms: 12,
        }
    }

    #[tokio::test]
    async fn create_and_complete_batch_round_trips() {
        let store = SqliteAuditStore::in_memory().await.unwrap();
        let batch_id = store.create_batch("corr-1", BatchSource::Manual).await.unwrap();
        store.set_batch_items_total(batch_id, 2).await.unwrap();
        store
            .record_operation(batch_id, sample_op("corr-1", OpResult::Success, 100))
            .await
            .unwrap();
        store
            .record_operation(batch_id, sample_op("corr-1", OpResult::Error, 101))
            .await
            .unwrap();
        store.finish_batch(batch_id).await.unwrap();

        let batch = store.get_batch("corr-1").await.unwrap().unwrap();
        assert!(batch.is_complete());
        assert_eq!(batch.items_success, 1);
        assert_eq!(batch.items_error, 1);
        assert_eq!(batch.items_total, 2);
        assert!(batch.counts_are_consistent());
    }

    #[tokio::test]
    async fn retention_defaults_to_unlimited() {
        let store = SqliteAuditStore::in_memory().await.unwrap();
        let policy = store.get_retention().await.unwrap();
        assert!(policy.max_bytes.is_none());
        assert!(policy.max_age_days.is_none());
    }

    #[tokio::test]
    async fn update_retention_is_idempotent_and_monotonic() {
        let store = SqliteAuditStore::in_memory().await.unwrap();
        let first = store.update_retention(Some(1024), Some(30), 100).await.unwrap();
        let second = store.update_retention(Some(1024), Some(30), 200).await.unwrap();
        assert_eq!(first.max_bytes, second.max_bytes);
        assert!(second.updated_at_millis >= first.updated_at_millis);
    }

    #[tokio::test]
    async fn delete_operations_before_cutoff_honors_ttl() {
        let store = SqliteAuditStore::in_memory().await.unwrap();
        let batch_id = store.create_batch("corr-2", BatchSource::Scheduled).await.unwrap();
        store
            .record_operation(batch_id, sample_op("corr-2", OpResult::Success, 10))
            .await
            .unwrap();
        store
            .record_operation(batch_id, sample_op("corr-2", OpResult::Success, 1_000))
            .await
            .unwrap();

        let deleted = store.delete_operations_before(500).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = store
            .list_operations(&OperationFilter::default(), Page { page: 1, page_size: 10 })
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].occurred_at_millis, 1_000);
    }
}
