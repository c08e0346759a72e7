use std::collections::{HashMap, HashSet};

use credsync_core::principal::Principal;
use credsync_core::verifier::ScramMechanism;

use crate::user::IdpUser;

/// Diff-engine inputs not carried by either snapshot.
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    pub always_upsert: bool,
    /// Exact names and `"prefix-*"`-style prefix patterns exempted from
    /// deletion even when absent from the IdP snapshot.
    pub excluded: Vec<String>,
    pub dry_run: bool,
}

impl DiffOptions {
    fn excludes(&self, name: &str) -> bool {
        self.excluded.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => pattern == name,
        })
    }
}

/// The immutable plan a [`diff`] call produces.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub upserts: Vec<IdpUser>,
    pub deletes: Vec<Principal>,
    pub dry_run: bool,
}

impl SyncPlan {
    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Pure function from two population snapshots to a sync plan. Upserts
/// preserve the enumerator's yield order; deletes are sorted
/// lexicographically for deterministic output.
pub fn diff(
    idp_users: &[IdpUser],
    broker_principals: &HashMap<Principal, Vec<ScramMechanism>>,
    realm: &str,
    options: &DiffOptions,
) -> SyncPlan {
    let idp_names: HashSet<&str> = idp_users.iter().map(|u| u.username.as_str()).collect();

    let upserts = idp_users
        .iter()
        .filter(|user| {
            options.always_upsert
                || !broker_principals.contains_key(&Principal::new(realm, user.username.clone()))
        })
        .cloned()
        .collect();

    let mut deletes: Vec<Principal> = broker_principals
        .keys()
        .filter(|principal| principal.realm == realm)
        .filter(|principal| !idp_names.contains(principal.name.as_str()))
        .filter(|principal| !options.excludes(&principal.name))
        .cloned()
        .collect();
    deletes.sort();

    SyncPlan {
        upserts,
        deletes,
        dry_run: options.dry_run,
    }
}
