use std::hash::Hash;

use crate::correlation::{CorrelationGuard, CorrelationStore};

/// The host IdP's own password-hashing extension point that this plug-in
/// registers against. A host adapter implements this with whatever
/// default hasher the host ships (e.g. PBKDF2/bcrypt); this crate never
/// reimplements it.
pub trait HostPasswordHasher: Send + Sync {
    fn encode(&self, password: &str, iterations: u32) -> String;
}

/// Captures plaintext before the host hashes it, without altering the
/// host's own stored hash.
///
/// `encode_credential` stores `password` in the correlation store keyed
/// by `key` (typically the executing worker/request identity) and
/// returns both the host's unchanged encoded hash and the guard that
/// must be held for the remaining lifetime of the request so the
/// plaintext is cleared when that scope ends.
pub struct PasswordHashInterceptor<K, H> {
    correlation: CorrelationStore<K>,
    hasher: H,
}

impl<K, H> PasswordHashInterceptor<K, H>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    H: HostPasswordHasher,
{
    pub fn new(correlation: CorrelationStore<K>, hasher: H) -> Self {
        Self { correlation, hasher }
    }

    /// On `encodeCredential(password, iterations)`: stash the plaintext,
    /// then delegate to the host's default hasher. The returned string is
    /// exactly what the host would have stored without this plug-in
    /// installed.
    pub fn encode_credential(
        &self,
        key: K,
        password: &str,
        iterations: u32,
    ) -> (String, CorrelationGuard<K>) {
        let guard = self.correlation.set(key, password.to_string());
        let encoded = self.hasher.encode(password, iterations);
        (encoded, guard)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct StubHasher;
    impl HostPasswordHasher for StubHasher {
        fn encode(&self, password: &str, iterations: u32) -> String {
            format!("hashed:{password}:{iterations}")
        }
    }

    #[test]
    fn delegates_to_host_hasher_unchanged() {
        let correlation = CorrelationStore::new();
        let interceptor = PasswordHashInterceptor::new(correlation.clone(), StubHasher);

        let (encoded, guard) = interceptor.encode_credential(1u64, "hunter2", 27500);
        assert_eq!(encoded, "hashed:hunter2:27500");
        assert_eq!(&*correlation.get_and_clear(&1).unwrap(), "hunter2");
        drop(guard);
    }
}
