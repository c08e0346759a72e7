use serde::Deserialize;

/// The default service-account name prefixes excluded from
/// synchronization.
pub const DEFAULT_SERVICE_PREFIXES: &[&str] = &["service-account-", "system-", "admin-"];

/// One row of the IdP's user population, as returned by the admin
/// users-list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdpUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub created_at_millis: Option<i64>,
}

impl IdpUser {
    /// `true` unless the user is disabled or its username matches one of
    /// `prefixes` — the filter applied before the enumerator yields a
    /// page.
    pub fn participates(&self, prefixes: &[String]) -> bool {
        self.enabled && !prefixes.iter().any(|prefix| self.username.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn user(username: &str, enabled: bool) -> IdpUser {
        IdpUser {
            id: "u1".into(),
            username: username.into(),
            email: None,
            enabled,
            created_at_millis: None,
        }
    }

    #[test]
    fn disabled_user_does_not_participate() {
        let prefixes: Vec<String> = vec![];
        assert!(!user("alice", false).participates(&prefixes));
    }

    #[test]
    fn service_account_prefix_excludes() {
        let prefixes = vec!["service-account-".to_string()];
        assert!(!user("service-account-sync", true).participates(&prefixes));
    }

    #[test]
    fn ordinary_enabled_user_participates() {
        let prefixes = vec!["service-account-".to_string()];
        assert!(user("alice", true).participates(&prefixes));
    }
}
