use thiserror::Error;

/// Errors the User Enumerator's HTTP layer can raise, kept distinct from
/// but convertible into [`credsync_core::SyncError`] the same way
/// `credsync_broker::BrokerError` is — one small taxonomy per external
/// dependency, folded into the shared one at the call site.
#[derive(Debug, Error, Clone)]
pub enum IdpError {
    /// A page fetch failed after exhausting the retry budget: three
    /// retries and one final attempt, all failed.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),

    /// The request itself was rejected (auth denied, malformed query) —
    /// retrying would not help.
    #[error("identity provider rejected the request: {0}")]
    Fatal(String),
}

impl From<IdpError> for credsync_core::SyncError {
    fn from(value: IdpError) -> Self {
        match value {
            IdpError::Unavailable(message) => credsync_core::SyncError::TransientDependency(message),
            IdpError::Fatal(message) => credsync_core::SyncError::FatalDependency(message),
        }
    }
}
