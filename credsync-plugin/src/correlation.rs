use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use zeroize::Zeroizing;

/// Request-scoped plaintext carrier between the Password Hash
/// Interceptor and the Admin Event Subscriber.
///
/// Generic over the key a host adapter uses to identify "the current
/// request" — a worker-thread id by default, but anything `Eq + Hash +
/// Clone` so a host with real request-scoped storage can supply its own
/// id instead. Values are wrapped in [`Zeroizing`] so the plaintext is
/// wiped the moment it is removed from the map, not just when the
/// process exits.
#[derive(Clone)]
pub struct CorrelationStore<K> {
    inner: Arc<Mutex<HashMap<K, Zeroizing<String>>>>,
}

impl<K> Default for CorrelationStore<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K> CorrelationStore<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `password` under `key` and returns a guard that clears it
    /// on drop, guaranteeing cleanup on every exit path. Callers hold the
    /// guard for exactly the scope of one interceptor invocation / one
    /// event-subscriber handling.
    pub fn set(&self, key: K, password: String) -> CorrelationGuard<K> {
        self.inner
            .lock()
            .unwrap()
            .insert(key.clone(), Zeroizing::new(password));
        CorrelationGuard {
            store: self.clone(),
            key,
        }
    }

    /// Removes and returns the plaintext for `key`, if any was set.
    /// Called once by the subscriber; a second call for the same key
    /// (or a call after the guard already cleared it) returns `None`.
    pub fn get_and_clear(&self, key: &K) -> Option<Zeroizing<String>> {
        self.inner.lock().unwrap().remove(key)
    }

    /// Removes any plaintext stored under `key` without returning it.
    pub fn clear(&self, key: &K) {
        self.inner.lock().unwrap().remove(key);
    }

    #[cfg(test)]
    fn contains(&self, key: &K) -> bool {
        self.inner.lock().unwrap().contains_key(key)
    }
}

/// RAII handle returned by [`CorrelationStore::set`]. Dropping it clears
/// the entry regardless of how the enclosing scope exits — success,
/// early return, or unwind — so a leak would require forgetting the
/// guard itself, not merely missing a cleanup call.
pub struct CorrelationGuard<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    store: CorrelationStore<K>,
    key: K,
}

impl<K> Drop for CorrelationGuard<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.store.clear(&self.key);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_and_clear_returns_value_once() {
        let store: CorrelationStore<u64> = CorrelationStore::new();
        let guard = store.set(1, "hunter2".to_string());
        std::mem::forget(guard); // simulate the subscriber outliving the interceptor's own scope

        let password = store.get_and_clear(&1).unwrap();
        assert_eq!(&*password, "hunter2");
        assert!(store.get_and_clear(&1).is_none());
    }

    #[test]
    fn guard_drop_clears_on_early_return() {
        let store: CorrelationStore<u64> = CorrelationStore::new();
        {
            let _guard = store.set(7, "p@ss".to_string());
            assert!(store.contains(&7));
        }
        assert!(!store.contains(&7));
    }

    #[test]
    fn distinct_keys_do_not_leak_across_each_other() {
        let store: CorrelationStore<u64> = CorrelationStore::new();
        let guard_a = store.set(1, "alpha".to_string());
        let guard_b = store.set(2, "beta".to_string());

        assert_eq!(&*store.get_and_clear(&1).unwrap(), "alpha");
        drop(guard_a);
        drop(guard_b);
        assert!(!store.contains(&2));
    }
}
