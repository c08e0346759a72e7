use serde::{Deserialize, Serialize};

use crate::verifier::ScramMechanism;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    ScramUpsert,
    ScramDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpResult {
    Success,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchSource {
    Scheduled,
    Manual,
    Immediate,
}

/// Append-only audit row for a single SCRAM operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: Option<i64>,
    pub correlation_id: String,
    pub occurred_at_millis: i64,
    pub realm: String,
    pub cluster_id: String,
    pub principal: String,
    pub op_type: OpType,
    pub mechanism: Option<ScramMechanism>,
    pub result: OpResult,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: i64,
}

/// One reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: Option<i64>,
    pub correlation_id: String,
    pub started_at_millis: i64,
    pub finished_at_millis: Option<i64>,
    pub source: BatchSource,
    pub items_total: i64,
    pub items_success: i64,
    pub items_error: i64,
}

impl BatchRecord {
    pub fn is_complete(&self) -> bool {
        self.finished_at_millis.is_some()
    }

    /// `items_success + items_error` must never exceed `items_total`.
    pub fn counts_are_consistent(&self) -> bool {
        self.items_success + self.items_error <= self.items_total
    }
}

/// The singleton retention-policy row (identity 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_bytes: Option<i64>,
    pub max_age_days: Option<i64>,
    pub approx_db_bytes: i64,
    pub updated_at_millis: i64,
}
