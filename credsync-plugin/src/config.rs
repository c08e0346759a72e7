use credsync_core::ScramMechanism;

/// Configuration consumed by the Admin Event Subscriber.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Empty means "all realms".
    pub realm_allowlist: Vec<String>,
    pub mechanisms: Vec<ScramMechanism>,
    pub iterations: u32,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            realm_allowlist: Vec::new(),
            mechanisms: vec![ScramMechanism::Sha256],
            iterations: credsync_core::verifier::MIN_ITERATIONS,
        }
    }
}

impl PluginConfig {
    pub fn realm_allowed(&self, realm: &str) -> bool {
        self.realm_allowlist.is_empty() || self.realm_allowlist.iter().any(|r| r == realm)
    }
}

/// Resolves one configuration value from its priority order:
/// host-provided config scope, then a process-wide property, then an
/// environment variable. The host scope and the process property are
/// both optional inputs supplied by the caller (the concrete host
/// adapter and JVM-style system-property analog are out of scope here);
/// this function only encodes the precedence rule.
pub fn resolve_config_value(
    host_scope_value: Option<&str>,
    process_property_value: Option<&str>,
    env_var_name: &str,
) -> Option<String> {
    host_scope_value
        .map(str::to_string)
        .or_else(|| process_property_value.map(str::to_string))
        .or_else(|| std::env::var(env_var_name).ok())
}
