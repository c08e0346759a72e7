use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use credsync_core::{Principal, ScramMechanism};

use crate::client::{Alteration, BrokerScramClient};
use crate::error::BrokerError;

/// In-memory [`BrokerScramClient`] used by `credsync-reconcile` and
/// `credsync-plugin` tests in place of a live broker.
#[derive(Default)]
pub struct FakeBrokerScramClient {
    principals: Mutex<HashMap<Principal, Vec<ScramMechanism>>>,
    /// Principals whose next `alter` call should fail, and with what.
    failing: Mutex<HashMap<Principal, BrokerError>>,
}

impl FakeBrokerScramClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, principal: Principal, mechanisms: Vec<ScramMechanism>) {
        self.principals.lock().unwrap().insert(principal, mechanisms);
    }

    /// Makes the next `alter` touching `principal` fail with `error`.
    pub fn fail_next(&self, principal: Principal, error: BrokerError) {
        self.failing.lock().unwrap().insert(principal, error);
    }

    pub fn principal_count(&self) -> usize {
        self.principals.lock().unwrap().len()
    }
}

impl BrokerScramClient for FakeBrokerScramClient {
    async fn describe_all(&self) -> Result<HashMap<Principal, Vec<ScramMechanism>>, BrokerError> {
        Ok(self.principals.lock().unwrap().clone())
    }

    async fn describe(
        &self,
        principals: &[Principal],
    ) -> Result<HashMap<Principal, Vec<ScramMechanism>>, BrokerError> {
        let all = self.principals.lock().unwrap();
        Ok(principals
            .iter()
            .filter_map(|p| all.get(p).map(|mechs| (p.clone(), mechs.clone())))
            .collect())
    }

    async fn alter(
        &self,
        alterations: Vec<Alteration>,
    ) -> HashMap<Principal, BoxFuture<'static, Result<(), BrokerError>>> {
        let mut out = HashMap::new();
        for alteration in alterations {
            let principal = alteration.principal().clone();
            let forced_failure = self.failing.lock().unwrap().remove(&principal);

            let result = if let Some(err) = forced_failure {
                Err(err)
            } else {
                let mut principals = self.principals.lock().unwrap();
                match &alteration {
                    Alteration::Upsert { verifier, .. } => {
                        let mechs = principals.entry(principal.clone()).or_default();
                        if !mechs.contains(&verifier.mechanism) {
                            mechs.push(verifier.mechanism);
                        }
                    }
                    Alteration::Delete { mechanism, .. } => {
                        if let Some(mechs) = principals.get_mut(&principal) {
                            mechs.retain(|m| m != mechanism);
                            if mechs.is_empty() {
                                principals.remove(&principal);
                            }
                        }
                    }
                }
                Ok(())
            };

            out.insert(principal, Box::pin(async move { result }) as BoxFuture<'static, _>);
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use credsync_core::verifier;

    #[tokio::test]
    async fn upsert_then_describe_all_reflects_it() {
        let client = FakeBrokerScramClient::new();
        let principal = Principal::new("default", "alice");
        let verifier = verifier::generate("hunter2", ScramMechanism::Sha256, 4096).unwrap();

        client.upsert(principal.clone(), verifier).await.unwrap();

        let all = client.describe_all().await.unwrap();
        assert_eq!(all.get(&principal), Some(&vec![ScramMechanism::Sha256]));
    }

    #[tokio::test]
    async fn forced_failure_surfaces_on_alter() {
        let client = FakeBrokerScramClient::new();
        let principal = Principal::new("default", "bob");
        client.fail_next(principal.clone(), BrokerError::Transient("down".into()));

        let verifier = verifier::generate("hunter2", ScramMechanism::Sha256, 4096).unwrap();
        let err = client.upsert(principal, verifier).await.unwrap_err();
        assert!(matches!(err, BrokerError::Transient(_)));
    }

    #[tokio::test]
    async fn delete_removes_principal_once_mechanisms_empty() {
        let client = FakeBrokerScramClient::new();
        let principal = Principal::new("default", "carol");
        client.seed(principal.clone(), vec![ScramMechanism::Sha256]);

        client.delete(principal.clone(), ScramMechanism::Sha256).await.unwrap();

        let all = client.describe_all().await.unwrap();
        assert!(!all.contains_key(&principal));
    }
}
