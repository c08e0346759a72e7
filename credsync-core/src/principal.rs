use std::fmt::{self, Display, Formatter};

/// A broker-side identity: an IdP tenant (`realm`) plus a login name.
///
/// Name comparison is exact and case-sensitive; the realm is carried
/// alongside the name everywhere a principal travels so the diff engine
/// and the audit trail never conflate users across tenants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Principal {
    pub realm: String,
    pub name: String,
}

impl Principal {
    pub fn new(realm: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            name: name.into(),
        }
    }

    /// `true` if `name` starts with any of `prefixes`, used both for the
    /// service-account filter (§3) and the exclusion-list prefix matches
    /// (`"admin-*"`-style, §4.4).
    pub fn name_has_prefix(&self, prefixes: &[String]) -> bool {
        prefixes.iter().any(|prefix| self.name.starts_with(prefix))
    }
}

impl Display for Principal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.realm)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn name_has_prefix_matches_any() {
        let p = Principal::new("default", "admin-bot");
        let prefixes = vec!["service-account-".to_string(), "admin-".to_string()];
        assert!(p.name_has_prefix(&prefixes));
    }

    #[test]
    fn name_has_prefix_rejects_non_matching() {
        let p = Principal::new("default", "alice");
        let prefixes = vec!["service-account-".to_string()];
        assert!(!p.name_has_prefix(&prefixes));
    }

    #[test]
    fn display_is_name_at_realm() {
        let p = Principal::new("tenant1", "alice");
        assert_eq!(p.to_string(), "alice@tenant1");
    }
}
