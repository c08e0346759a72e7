use thiserror::Error;

/// The error taxonomy shared across the agent and the plug-in.
///
/// Every fallible boundary in this workspace resolves into one of these
/// variants so the Control API can map them to HTTP statuses and the
/// queue/orchestrator can decide whether to retry.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Caller bug: malformed input. 400-class, never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The IdP or broker is unavailable, timed out, or the network is
    /// down. Retried per policy; feeds the circuit breaker for the
    /// dependency it came from.
    #[error("transient dependency failure: {0}")]
    TransientDependency(String),

    /// Unsupported protocol version, auth denied, or another error the
    /// dependency itself will never recover from on retry. Trips the
    /// breaker immediately.
    #[error("fatal dependency failure: {0}")]
    FatalDependency(String),

    /// A call was rejected because the circuit breaker for its
    /// dependency is open. Does not count against retry budgets.
    #[error("circuit open for dependency `{0}`")]
    CircuitOpen(String),

    /// A reconciliation run (or purge) was already in progress.
    #[error("an operation of this kind is already running")]
    AlreadyRunning,

    /// A bug in this process's own bookkeeping (e.g. an invariant
    /// violated). Recorded with `errorCode=INTERNAL`; never aborts a
    /// reconciliation run by itself.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

/// Stable machine-readable codes used in `sync_operation.error_code` and
/// in the Control API's `{code, message}` error envelope.
impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::InvalidInput(_) => "INVALID_INPUT",
            SyncError::TransientDependency(_) => "TRANSIENT_DEPENDENCY",
            SyncError::FatalDependency(_) => "FATAL_DEPENDENCY",
            SyncError::CircuitOpen(_) => "CIRCUIT_OPEN",
            SyncError::AlreadyRunning => "ALREADY_RUNNING",
            SyncError::InternalInvariant(_) => "INTERNAL",
        }
    }

    /// The HTTP status the Control API should return for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            SyncError::InvalidInput(_) => 400,
            SyncError::TransientDependency(_) => 503,
            SyncError::FatalDependency(_) => 500,
            SyncError::CircuitOpen(_) => 503,
            SyncError::AlreadyRunning => 409,
            SyncError::InternalInvariant(_) => 500,
        }
    }

    /// `error_message` is truncated to 1024 chars before it is persisted
    /// to the audit store.
    pub fn truncated_message(&self) -> String {
        let message = self.to_string();
        if message.len() <= 1024 {
            message
        } else {
            message.chars().take(1024).collect()
        }
    }
}
