use credsync_core::breaker::{BreakerConfig, BreakerState, CircuitBreaker};

/// One breaker per external dependency: `idp` and `broker`. Shared
/// between the orchestrator (which trips them on outer
/// enumeration/describe failures) and the Control API's `/readyz`
/// handler (which reports them without touching either dependency).
pub struct DependencyBreakers {
    pub idp: CircuitBreaker,
    pub broker: CircuitBreaker,
}

impl DependencyBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            idp: CircuitBreaker::new("idp", config),
            broker: CircuitBreaker::new("broker", config),
        }
    }

    /// `true` iff every breaker is CLOSED — the gate `/readyz` ties to
    /// returning 200.
    pub fn all_closed(&self) -> bool {
        self.idp.state() == BreakerState::Closed && self.broker.state() == BreakerState::Closed
    }
}

impl Default for DependencyBreakers {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
