use std::hash::Hash;

use tracing::{debug, warn};

use credsync_broker::client::BrokerScramClient;
use credsync_core::event::AdminEvent;
use credsync_core::{Principal, ScramMechanism, SyncError, verifier};

use crate::config::PluginConfig;
use crate::correlation::CorrelationStore;

/// Resolves an event's subject username, either directly or by id
/// lookup via the host. A host adapter implements this against whatever
/// the concrete IdP exposes; this crate only consumes the trait.
pub trait HostUserLookup: Send + Sync {
    fn username_for_id(
        &self,
        realm: &str,
        id: &str,
    ) -> impl std::future::Future<Output = Option<String>> + Send;
}

/// Why the subscriber did not push a verifier for a given event. Not
/// persisted as an audit row: the immediate path has no batch/
/// correlation-id context of its own, so a skip here is represented at
/// the type level rather than written to the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Not a `USER` `CREATE`/`UPDATE`/password-reset event.
    NotApplicable,
    /// The event's realm is not in the configured allow-list.
    RealmFiltered,
    /// No plaintext was captured for this request — the interceptor was
    /// never invoked, or something else already consumed it.
    NoPassword,
    /// `resource_path` carried no id, or the host lookup found no user.
    UsernameUnresolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberOutcome {
    Applied {
        principal: Principal,
        mechanisms: Vec<ScramMechanism>,
    },
    Skipped(SkipReason),
}

/// Drives the applicability check, realm filtering, password retrieval,
/// username resolution, and credential push for one admin event. Any
/// broker failure propagates as `Err` so the host rolls back the
/// password change on the same request: the IdP and the broker must
/// agree, or neither changes.
pub async fn handle_admin_event<K, B, L>(
    event: &AdminEvent,
    correlation_key: K,
    correlation: &CorrelationStore<K>,
    broker: &B,
    username_lookup: &L,
    config: &PluginConfig,
) -> Result<SubscriberOutcome, SyncError>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    B: BrokerScramClient,
    L: HostUserLookup,
{
    if !event.is_password_update_candidate() {
        return Ok(SubscriberOutcome::Skipped(SkipReason::NotApplicable));
    }

    if !config.realm_allowed(&event.realm) {
        debug!(realm = %event.realm, "skipping admin event: realm not allow-listed");
        return Ok(SubscriberOutcome::Skipped(SkipReason::RealmFiltered));
    }

    let Some(password) = correlation.get_and_clear(&correlation_key) else {
        debug!("skipping admin event: no plaintext password captured");
        return Ok(SubscriberOutcome::Skipped(SkipReason::NoPassword));
    };

    let Some(id) = event.resource_id() else {
        return Ok(SubscriberOutcome::Skipped(SkipReason::UsernameUnresolved));
    };
    let Some(username) = username_lookup.username_for_id(&event.realm, id).await else {
        warn!(realm = %event.realm, %id, "host lookup found no username for resource id");
        return Ok(SubscriberOutcome::Skipped(SkipReason::UsernameUnresolved));
    };

    let principal = Principal::new(event.realm.clone(), username);

    for mechanism in &config.mechanisms {
        let credential = verifier::generate(&password, *mechanism, config.iterations)?;
        if let Err(err) = broker.upsert(principal.clone(), credential).await {
            warn!(%principal, %err, "broker rejected credential push, host must roll back");
            return Err(err.into());
        }
    }

    debug!(%principal, "pushed scram credential from intercepted password change");
    Ok(SubscriberOutcome::Applied {
        principal,
        mechanisms: config.mechanisms.clone(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use credsync_broker::fake::FakeBrokerScramClient;
    use credsync_core::event::{OperationType, ResourceType};

    struct StaticLookup(Option<String>);
    impl HostUserLookup for StaticLookup {
        async fn username_for_id(&self, _realm: &str, _id: &str) -> Option<String> {
            self.0.clone()
        }
    }

    fn event(path: &str, op: OperationType) -> AdminEvent {
        AdminEvent {
            realm: "default".into(),
            resource_type: ResourceType::User,
            operation_type: op,
            resource_path: path.into(),
        }
    }

    #[tokio::test]
    async fn pushes_verifier_when_password_present() {
        let correlation: CorrelationStore<u64> = CorrelationStore::new();
        let _guard = correlation.set(1, "hunter2".to_string());
        let broker = FakeBrokerScramClient::new();
        let lookup = StaticLookup(Some("alice".to_string()));
        let config = PluginConfig::default();

        let outcome = handle_admin_event(
            &event("users/abc", OperationType::Update),
            1u64,
            &correlation,
            &broker,
            &lookup,
            &config,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, SubscriberOutcome::Applied { .. }));
        assert_eq!(broker.principal_count(), 1);
    }

    #[tokio::test]
    async fn skips_when_no_password_captured() {
        let correlation: CorrelationStore<u64> = CorrelationStore::new();
        let broker = FakeBrokerScramClient::new();
        let lookup = StaticLookup(Some("alice".to_string()));
        let config = PluginConfig::default();

        let outcome = handle_admin_event(
            &event("users/abc", OperationType::Update),
            1u64,
            &correlation,
            &broker,
            &lookup,
            &config,
        )
        .await
        .unwrap();

        assert_eq!(outcome, SubscriberOutcome::Skipped(SkipReason::NoPassword));
    }

    #[tokio::test]
    async fn skips_when_realm_not_allowlisted() {
        let correlation: CorrelationStore<u64> = CorrelationStore::new();
        let _guard = correlation.set(1, "hunter2".to_string());
        let broker = FakeBrokerScramClient::new();
        let lookup = StaticLookup(Some("alice".to_string()));
        let config = PluginConfig {
            realm_allowlist: vec!["other-realm".to_string()],
            ..Default::default()
        };

        let outcome = handle_admin_event(
            &event("users/abc", OperationType::Update),
            1u64,
            &correlation,
            &broker,
            &lookup,
            &config,
        )
        .await
        .unwrap();

        assert_eq!(outcome, SubscriberOutcome::Skipped(SkipReason::RealmFiltered));
        // The allow-list check happens before the password is consumed.
        assert!(correlation.get_and_clear(&1).is_some());
    }

    #[tokio::test]
    async fn user_delete_is_not_applicable_here() {
        let correlation: CorrelationStore<u64> = CorrelationStore::new();
        let broker = FakeBrokerScramClient::new();
        let lookup = StaticLookup(Some("alice".to_string()));
        let config = PluginConfig::default();

        let outcome = handle_admin_event(
            &event("users/abc", OperationType::Delete),
            1u64,
            &correlation,
            &broker,
            &lookup,
            &config,
        )
        .await
        .unwrap();

        assert_eq!(outcome, SubscriberOutcome::Skipped(SkipReason::NotApplicable));
    }

    #[tokio::test]
    async fn broker_failure_propagates_for_host_rollback() {
        let correlation: CorrelationStore<u64> = CorrelationStore::new();
        let _guard = correlation.set(1, "hunter2".to_string());
        let broker = FakeBrokerScramClient::new();
        broker.fail_next(
            Principal::new("default", "alice"),
            credsync_broker::error::BrokerError::Fatal("rejected".into()),
        );
        let lookup = StaticLookup(Some("alice".to_string()));
        let config = PluginConfig::default();

        let result = handle_admin_event(
            &event("users/abc", OperationType::Update),
            1u64,
            &correlation,
            &broker,
            &lookup,
            &config,
        )
        .await;

        assert!(matches!(result, Err(SyncError::FatalDependency(_))));
    }
}
