use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use credsync_backend::AuditStore;
use credsync_broker::client::{Alteration, BrokerScramClient};
use credsync_core::audit::{OpResult, OperationRecord};
use credsync_core::event::{AdminEvent, EventEnvelope};
use credsync_core::{Principal, ScramMechanism};

const DEFAULT_CAPACITY: usize = 1000;
const DEFAULT_WORKERS: usize = 2;
const RETRY_BASE_MILLIS: u64 = 1000;
const RETRY_MAX_MILLIS: u64 = 30_000;
const MAX_ATTEMPTS: u32 = 3;

/// What happens to a newly enqueued event once the bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Reject the new event; `enqueue` returns `false`.
    #[default]
    Reject,
    /// Evict the oldest queued event, then enqueue; the eviction is
    /// counted in [`QueueMetrics::dropped`].
    DropOldest,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub capacity: usize,
    pub workers: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            workers: DEFAULT_WORKERS,
            overflow_policy: OverflowPolicy::Reject,
        }
    }
}

/// Snapshot of queue depth, dropped count, scheduled retries, and
/// terminal failures.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    dropped: AtomicU64,
    scheduled_retries: AtomicU64,
    terminal_failures: AtomicU64,
}

impl QueueMetrics {
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn scheduled_retries(&self) -> u64 {
        self.scheduled_retries.load(Ordering::Relaxed)
    }

    pub fn terminal_failures(&self) -> u64 {
        self.terminal_failures.load(Ordering::Relaxed)
    }
}

/// Translates an admin event into an optional broker alteration.
/// Consumes [`AdminEvent::resource_type_policy`] rather than duplicating
/// the `{resourceType, operationType} -> opType` table.
pub trait EventMapper: Send + Sync {
    fn map(&self, event: &AdminEvent) -> Option<Alteration>;
}

/// Maps `CLIENT`/`USER` delete-and-create events using a fixed mechanism
/// and a freshly generated verifier for upserts; `resource_id()` supplies
/// the principal name directly (client/service-account ids double as
/// broker usernames, unlike the plug-in's human-username resolution).
pub struct DefaultEventMapper {
    pub realm: String,
    pub mechanism: ScramMechanism,
    pub iterations: u32,
}

impl EventMapper for DefaultEventMapper {
    fn map(&self, event: &AdminEvent) -> Option<Alteration> {
        let op_type = event.resource_type_policy()?;
        let id = event.resource_id()?;
        let principal = Principal::new(self.realm.clone(), id.to_string());

        match op_type {
            credsync_core::audit::OpType::ScramDelete => {
                Some(Alteration::Delete { principal, mechanism: self.mechanism })
            }
            credsync_core::audit::OpType::ScramUpsert => {
                let password = random_password();
                let verifier =
                    credsync_core::verifier::generate(&password, self.mechanism, self.iterations)
                        .ok()?;
                Some(Alteration::Upsert { principal, verifier })
            }
        }
    }
}

fn random_password() -> String {
    use base64::Engine;
    let mut bytes = [0u8; 24];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

struct Inner {
    queue: Mutex<VecDeque<EventEnvelope>>,
    config: QueueConfig,
    metrics: Arc<QueueMetrics>,
    notify: tokio::sync::Notify,
}

/// Bounded event queue plus its worker pool. Cloning an `EventQueue`
/// shares the same underlying state; every clone is a handle onto one
/// shared queue and worker set, not a separate copy.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

impl EventQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(config.capacity)),
                config,
                metrics: Arc::new(QueueMetrics::default()),
                notify: tokio::sync::Notify::new(),
            }),
        }
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.inner.metrics
    }

    /// A cloned handle onto this queue's counters, independent of the
    /// `EventQueue` handle itself — for wiring into `ApiState::queue_metrics`.
    pub fn metrics_handle(&self) -> Arc<QueueMetrics> {
        self.inner.metrics.clone()
    }

    pub fn depth(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Enqueues a freshly arrived event. Returns `false` if it was
    /// rejected outright under [`OverflowPolicy::Reject`].
    pub fn enqueue(&self, envelope: EventEnvelope) -> bool {
        let accepted = {
            let mut queue = self.inner.queue.lock().unwrap();
            if queue.len() >= self.inner.config.capacity {
                match self.inner.config.overflow_policy {
                    OverflowPolicy::Reject => false,
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        self.inner.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                        queue.push_back(envelope);
                        true
                    }
                }
            } else {
                queue.push_back(envelope);
                true
            }
        };
        if accepted {
            self.inner.notify.notify_one();
        }
        accepted
    }

    fn requeue_for_retry(&self, envelope: EventEnvelope) {
        self.inner.metrics.scheduled_retries.fetch_add(1, Ordering::Relaxed);
        let queue = self.clone();
        let delay = retry_delay(envelope.retry_count + 1);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(envelope.for_retry());
        });
    }

    fn pop(&self) -> Option<EventEnvelope> {
        self.inner.queue.lock().unwrap().pop_front()
    }

    /// Spawns the configured number of worker tasks; each polls the
    /// queue, maps the event via `mapper`, and applies the resulting
    /// alteration through `broker`. Terminal failures are recorded via
    /// `audit`. Returns the task handles so the caller can join them at
    /// shutdown.
    pub fn spawn_workers<M, B, S>(
        &self,
        mapper: Arc<M>,
        broker: Arc<B>,
        audit: Arc<S>,
        cluster_id: String,
    ) -> Vec<tokio::task::JoinHandle<()>>
    where
        M: EventMapper + 'static,
        B: BrokerScramClient + 'static,
        S: AuditStore + 'static,
    {
        (0..self.inner.config.workers)
            .map(|worker_id| {
                let queue = self.clone();
                let mapper = mapper.clone();
                let broker = broker.clone();
                let audit = audit.clone();
                let cluster_id = cluster_id.clone();
                tokio::spawn(async move {
                    queue.worker_loop(worker_id, mapper, broker, audit, cluster_id).await;
                })
            })
            .collect()
    }

    async fn worker_loop<M, B, S>(
        &self,
        worker_id: usize,
        mapper: Arc<M>,
        broker: Arc<B>,
        audit: Arc<S>,
        cluster_id: String,
    ) where
        M: EventMapper,
        B: BrokerScramClient,
        S: AuditStore,
    {
        loop {
            let envelope = match self.poll(Duration::from_secs(1)).await {
                Some(envelope) => envelope,
                None => continue,
            };

            if let Some(alteration) = mapper.map(&envelope.admin_event) {
                self.process(&envelope, alteration, &*broker, &*audit, &cluster_id, worker_id)
                    .await;
            }
        }
    }

    async fn poll(&self, timeout: Duration) -> Option<EventEnvelope> {
        if let Some(envelope) = self.pop() {
            return Some(envelope);
        }
        let _ = tokio::time::timeout(timeout, self.inner.notify.notified()).await;
        self.pop()
    }

    async fn process<B, S>(
        &self,
        envelope: &EventEnvelope,
        alteration: Alteration,
        broker: &B,
        audit: &S,
        cluster_id: &str,
        worker_id: usize,
    ) where
        B: BrokerScramClient,
        S: AuditStore,
    {
        let principal = alteration.principal().clone();
        let result = match alteration {
            Alteration::Upsert { principal, verifier } => broker.upsert(principal, verifier).await,
            Alteration::Delete { principal, mechanism } => broker.delete(principal, mechanism).await,
        };

        match result {
            Ok(()) => {
                info!(worker_id, %principal, "event queue applied alteration");
            }
            Err(err) if envelope.retry_count + 1 < MAX_ATTEMPTS => {
                warn!(worker_id, %principal, %err, retry_count = envelope.retry_count, "retrying after failure");
                self.requeue_for_retry(envelope.clone());
            }
            Err(err) => {
                self.inner.metrics.terminal_failures.fetch_add(1, Ordering::Relaxed);
                error!(worker_id, %principal, %err, "event exhausted retries, recording terminal failure");
                self.record_terminal_failure(audit, envelope, &principal, cluster_id, &err.to_string())
                    .await;
            }
        }
    }

    async fn record_terminal_failure<S: AuditStore>(
        &self,
        audit: &S,
        envelope: &EventEnvelope,
        principal: &Principal,
        cluster_id: &str,
        message: &str,
    ) {
        let batch_id = match audit
            .create_batch(&envelope.correlation_id, credsync_core::audit::BatchSource::Immediate)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                error!(%err, "failed to open batch for terminal failure row");
                return;
            }
        };

        let record = OperationRecord {
            id: None,
            correlation_id: envelope.correlation_id.clone(),
            occurred_at_millis: envelope.enqueued_at_millis,
            realm: principal.realm.clone(),
            cluster_id: cluster_id.to_string(),
            principal: principal.name.clone(),
            op_type: envelope
                .admin_event
                .resource_type_policy()
                .unwrap_or(credsync_core::audit::OpType::ScramUpsert),
            mechanism: None,
            result: OpResult::Error,
            error_code: Some("TERMINAL_RETRY_EXHAUSTED".to_string()),
            error_message: Some(message.chars().take(1024).collect()),
            duration_ms: 0,
        };

        if let Err(err) = audit.record_operation(batch_id, record).await {
            error!(%err, "failed to persist terminal failure row");
        }
        if let Err(err) = audit.finish_batch(batch_id).await {
            error!(%err, "failed to finish terminal failure batch");
        }
    }
}

/// `delay = min(base * 2^(attempt-1), maxDelay)`.
fn retry_delay(attempt: u32) -> Duration {
    let scaled = RETRY_BASE_MILLIS.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
    Duration::from_millis(scaled.min(RETRY_MAX_MILLIS))
}
