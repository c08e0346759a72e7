use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::RngCore;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use credsync_backend::{AuditStore, RetentionPurger};
use credsync_broker::client::{Alteration, BrokerScramClient};
use credsync_core::audit::{BatchSource, OpResult, OpType, OperationRecord};
use credsync_core::{Principal, ScramMechanism, SyncError};
use credsync_idp::diff::{DiffOptions, diff};
use credsync_idp::enumerator::UserEnumerator;

use crate::breakers::DependencyBreakers;

const MAX_PRINCIPALS_PER_ALTER: usize = 100;
const RANDOM_PASSWORD_BYTES: usize = 24;

/// Cluster identifier recorded on every operation row. Sourced from
/// configuration; this crate never discovers it dynamically.
pub type ClusterId = String;

/// Configuration the orchestrator needs beyond what the diff engine
/// already takes.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub realm: String,
    pub cluster_id: ClusterId,
    pub mechanism: ScramMechanism,
    pub iterations: u32,
    pub diff_options: DiffOptions,
}

/// Outcome of one [`ReconciliationOrchestrator::run`] invocation.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationResult {
    pub correlation_id: String,
    pub success: u64,
    pub error: u64,
    pub skipped: u64,
    pub duration_ms: i64,
    /// Set when an outer exception (not a per-item failure) aborted the
    /// run — the enumeration or the describe call itself failed.
    pub fatal_error_code: Option<String>,
}

/// Drives one full reconciliation run end-to-end. At most one run may be
/// in progress per instance; a second caller is rejected with
/// `AlreadyRunning` rather than queued.
pub struct ReconciliationOrchestrator<E, B, S> {
    enumerator: Arc<E>,
    broker: Arc<B>,
    audit: Arc<S>,
    purger: Arc<RetentionPurger<S>>,
    breakers: Arc<DependencyBreakers>,
    config: OrchestratorConfig,
    running: AtomicBool,
}

impl<E, B, S> ReconciliationOrchestrator<E, B, S>
where
    E: UserEnumerator,
    B: BrokerScramClient,
    S: AuditStore,
{
    pub fn new(
        enumerator: Arc<E>,
        broker: Arc<B>,
        audit: Arc<S>,
        purger: Arc<RetentionPurger<S>>,
        breakers: Arc<DependencyBreakers>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            enumerator,
            broker,
            audit,
            purger,
            breakers,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[instrument(skip(self), fields(correlation_id = tracing::field::Empty))]
    pub async fn run(&self, source: BatchSource) -> Result<ReconciliationResult, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning);
        }

        let result = self.run_locked(source).await;
        self.running.store(false, Ordering::Release);
        result
    }

    async fn run_locked(&self, source: BatchSource) -> Result<ReconciliationResult, SyncError> {
        let started = now_millis();
        let correlation_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        let batch_id = self
            .audit
            .create_batch(&correlation_id, source)
            .await
            .map_err(|err| SyncError::InternalInvariant(err.to_string()))?;

        let users = match self.fetch_idp_users().await {
            Ok(users) => users,
            Err(err) => return self.abort(batch_id, correlation_id, started, err).await,
        };

        let broker_snapshot = match self.describe_broker().await {
            Ok(snapshot) => snapshot,
            Err(err) => return self.abort(batch_id, correlation_id, started, err).await,
        };

        let plan = diff(&users, &broker_snapshot, &self.config.realm, &self.config.diff_options);

        self.audit
            .set_batch_items_total(batch_id, plan.len() as i64)
            .await
            .map_err(|err| SyncError::InternalInvariant(err.to_string()))?;

        let mut alterations = Vec::with_capacity(plan.len());
        let mut op_types = HashMap::new();

        for user in &plan.upserts {
            let principal = Principal::new(self.config.realm.clone(), user.username.clone());
            let password = random_password();
            let verifier = credsync_core::verifier::generate(
                &password,
                self.config.mechanism,
                self.config.iterations,
            )?;
            op_types.insert(principal.clone(), (OpType::ScramUpsert, Some(self.config.mechanism)));
            alterations.push(Alteration::Upsert { principal, verifier });
        }

        for principal in &plan.deletes {
            let mechanism = broker_snapshot
                .get(principal)
                .and_then(|mechs| mechs.first().copied())
                .unwrap_or(self.config.mechanism);
            op_types.insert(principal.clone(), (OpType::ScramDelete, Some(mechanism)));
            alterations.push(Alteration::Delete {
                principal: principal.clone(),
                mechanism,
            });
        }

        let (success, errors) = self
            .apply_alterations(batch_id, &correlation_id, alterations, &op_types)
            .await;

        self.audit
            .finish_batch(batch_id)
            .await
            .map_err(|err| SyncError::InternalInvariant(err.to_string()))?;

        self.trigger_post_batch_purge();

        info!(correlation_id = %correlation_id, success, errors, "reconciliation run complete");

        Ok(ReconciliationResult {
            correlation_id,
            success,
            error: errors,
            skipped: 0,
            duration_ms: now_millis() - started,
            fatal_error_code: None,
        })
    }

    async fn fetch_idp_users(&self) -> Result<Vec<credsync_idp::IdpUser>, SyncError> {
        self.breakers.idp.try_acquire()?;
        match self.enumerator.fetch_all().await {
            Ok(users) => {
                self.breakers.idp.record_success();
                Ok(users)
            }
            Err(err) => {
                self.breakers.idp.record_failure();
                Err(err.into())
            }
        }
    }

    async fn describe_broker(
        &self,
    ) -> Result<HashMap<Principal, Vec<ScramMechanism>>, SyncError> {
        self.breakers.broker.try_acquire()?;
        match self.broker.describe_all().await {
            Ok(snapshot) => {
                self.breakers.broker.record_success();
                Ok(snapshot)
            }
            Err(err) => {
                self.breakers.broker.record_failure();
                Err(err.into())
            }
        }
    }

    async fn apply_alterations(
        &self,
        batch_id: i64,
        correlation_id: &str,
        alterations: Vec<Alteration>,
        op_types: &HashMap<Principal, (OpType, Option<ScramMechanism>)>,
    ) -> (u64, u64) {
        let mut success = 0u64;
        let mut errors = 0u64;

        for chunk in alterations.chunks(MAX_PRINCIPALS_PER_ALTER) {
            let submitted_at = now_millis();
            let futures_map = self.broker.alter(chunk.to_vec()).await;

            let mut pending: FuturesUnordered<_> = futures_map
                .into_iter()
                .map(|(principal, future)| async move { (principal, future.await) })
                .collect();

            while let Some((principal, outcome)) = pending.next().await {
                let duration_ms = now_millis() - submitted_at;
                let (op_type, mechanism) = op_types
                    .get(&principal)
                    .copied()
                    .unwrap_or((OpType::ScramUpsert, None));

                let (result, error_code, error_message) = match outcome {
                    Ok(()) => (OpResult::Success, None, None),
                    Err(err) => {
                        warn!(%principal, %err, "broker alteration failed");
                        let message: String = err.to_string().chars().take(1024).collect();
                        (OpResult::Error, Some(err.code().to_string()), Some(message))
                    }
                };

                match result {
                    OpResult::Success => success += 1,
                    OpResult::Error => errors += 1,
                    OpResult::Skipped => {}
                }

                let record = OperationRecord {
                    id: None,
                    correlation_id: correlation_id.to_string(),
                    occurred_at_millis: now_millis(),
                    realm: principal.realm.clone(),
                    cluster_id: self.config.cluster_id.clone(),
                    principal: principal.name.clone(),
                    op_type,
                    mechanism,
                    result,
                    error_code,
                    error_message,
                    duration_ms,
                };

                if let Err(err) = self.audit.record_operation(batch_id, record).await {
                    error!(%err, "failed to persist operation row");
                }
            }
        }

        (success, errors)
    }

    async fn abort(
        &self,
        batch_id: i64,
        correlation_id: String,
        started: i64,
        err: SyncError,
    ) -> Result<ReconciliationResult, SyncError> {
        error!(%correlation_id, %err, "reconciliation run aborted by outer failure");
        if let Err(finish_err) = self.audit.finish_batch(batch_id).await {
            error!(%finish_err, "failed to mark aborted batch as finished");
        }
        Ok(ReconciliationResult {
            correlation_id,
            success: 0,
            error: 0,
            skipped: 0,
            duration_ms: now_millis() - started,
            fatal_error_code: Some(err.code().to_string()),
        })
    }

    fn trigger_post_batch_purge(&self) {
        let purger = self.purger.clone();
        tokio::spawn(async move {
            if let Err(err) = purger.run("post-batch").await {
                error!(%err, "post-batch retention purge failed");
            }
        });
    }
}

/// A fresh random 24-byte password, generated for every upsert and never
/// persisted.
fn random_password() -> String {
    let mut bytes = [0u8; RANDOM_PASSWORD_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
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
    use credsync_backend::audit::SqliteAuditStore;
    use credsync_broker::error::BrokerError;
    use credsync_broker::fake::FakeBrokerScramClient;
    use credsync_idp::IdpUser;
    use credsync_idp::fake::FakeUserEnumerator;

    fn user(name: &str) -> IdpUser {
        IdpUser {
            id: format!("id-{name}"),
            username: name.into(),
            email: None,
            enabled: true,
            created_at_millis: None,
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            realm: "default".into(),
            cluster_id: "cluster-1".into(),
            mechanism: ScramMechanism::Sha256,
            iterations: 4096,
            diff_options: DiffOptions {
                always_upsert: false,
                excluded: vec!["admin-*".into(), "admin".into()],
                dry_run: false,
            },
        }
    }

    async fn orchestrator(
        users: Vec<IdpUser>,
        broker: FakeBrokerScramClient,
    ) -> ReconciliationOrchestrator<FakeUserEnumerator, FakeBrokerScramClient, SqliteAuditStore> {
        let audit = Arc::new(SqliteAuditStore::in_memory().await.unwrap());
        let purger = Arc::new(RetentionPurger::new(audit.clone()));
        ReconciliationOrchestrator::new(
            Arc::new(FakeUserEnumerator::new(users)),
            Arc::new(broker),
            audit,
            purger,
            Arc::new(DependencyBreakers::default()),
            config(),
        )
    }

    #[tokio::test]
    async fn scenario_3_creates_missing_and_deletes_orphans() {
        let broker = FakeBrokerScramClient::new();
        broker.seed(Principal::new("default", "u1"), vec![ScramMechanism::Sha256]);
        broker.seed(Principal::new("default", "u4"), vec![ScramMechanism::Sha256]);
        broker.seed(Principal::new("default", "admin"), vec![ScramMechanism::Sha256]);

        let orchestrator = orchestrator(vec![user("u1"), user("u2"), user("u3")], broker).await;
        let result = orchestrator.run(BatchSource::Manual).await.unwrap();

        assert_eq!(result.success, 3); // u2, u3 upserted; u4 deleted
        assert_eq!(result.error, 0);
        assert!(result.fatal_error_code.is_none());
    }

    #[tokio::test]
    async fn second_concurrent_run_is_rejected() {
        let orchestrator = Arc::new(orchestrator(vec![user("u1")], FakeBrokerScramClient::new()).await);
        orchestrator.running.store(true, Ordering::Release);

        let err = orchestrator.run(BatchSource::Manual).await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning));
    }

    #[tokio::test]
    async fn partial_broker_failure_is_recorded_without_aborting() {
        let broker = FakeBrokerScramClient::new();
        broker.fail_next(
            Principal::new("default", "u3"),
            BrokerError::Unknown("boom".into()),
        );

        let orchestrator = orchestrator(vec![user("u2"), user("u3")], broker).await;
        let result = orchestrator.run(BatchSource::Manual).await.unwrap();

        assert_eq!(result.success, 1);
        assert_eq!(result.error, 1);
    }

    #[tokio::test]
    async fn idp_failure_aborts_with_fatal_code() {
        let enumerator = FakeUserEnumerator::new(vec![]);
        enumerator.fail_next_call(credsync_idp::IdpError::Unavailable("down".into()));

        let audit = Arc::new(SqliteAuditStore::in_memory().await.unwrap());
        let purger = Arc::new(RetentionPurger::new(audit.clone()));
        let orchestrator = ReconciliationOrchestrator::new(
            Arc::new(enumerator),
            Arc::new(FakeBrokerScramClient::new()),
            audit,
            purger,
            Arc::new(DependencyBreakers::default()),
            config(),
        );

        let result = orchestrator.run(BatchSource::Manual).await.unwrap();
        assert!(result.fatal_error_code.is_some());
    }

    #[tokio::test]
    async fn always_upsert_running_twice_with_no_changes_still_upserts_every_time() {
        let broker = FakeBrokerScramClient::new();
        let mut cfg = config();
        cfg.diff_options.always_upsert = true;

        let audit = Arc::new(SqliteAuditStore::in_memory().await.unwrap());
        let purger = Arc::new(RetentionPurger::new(audit.clone()));
        let orchestrator = ReconciliationOrchestrator::new(
            Arc::new(FakeUserEnumerator::new(vec![user("u1")])),
            Arc::new(broker),
            audit,
            purger,
            Arc::new(DependencyBreakers::default()),
            cfg,
        );

        let first = orchestrator.run(BatchSource::Manual).await.unwrap();
        let second = orchestrator.run(BatchSource::Manual).await.unwrap();
        assert_eq!(first.success, 1);
        assert_eq!(second.success, 1);
    }
}
