use thiserror::Error;

/// The broker admin RPC's own error classification, distinct from but
/// convertible into the workspace-wide [`credsync_core::SyncError`]
/// taxonomy used by the orchestrator and the Control API.
#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    #[error("broker call timed out: {0}")]
    Transient(String),
    #[error("broker rejected the call: {0}")]
    Fatal(String),
    #[error("unclassified broker error: {0}")]
    Unknown(String),
}

impl BrokerError {
    /// Classifies a raw `rdkafka` admin-RPC error string into the
    /// Transient/Fatal/Unknown buckets. A timeout is transient; an
    /// "unsupported version" response is fatal; anything else is unknown
    /// rather than guessed at.
    pub fn classify(raw: &rdkafka::error::KafkaError) -> Self {
        let message = raw.to_string();
        let lowercase = message.to_lowercase();
        if lowercase.contains("timed out") || lowercase.contains("timeout") {
            BrokerError::Transient(message)
        } else if lowercase.contains("unsupported") && lowercase.contains("version") {
            BrokerError::Fatal(message)
        } else {
            BrokerError::Unknown(message)
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::Transient(_) => "TRANSIENT",
            BrokerError::Fatal(_) => "FATAL",
            BrokerError::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<BrokerError> for credsync_core::SyncError {
    fn from(value: BrokerError) -> Self {
        match value {
            BrokerError::Transient(message) => credsync_core::SyncError::TransientDependency(message),
            BrokerError::Fatal(message) => credsync_core::SyncError::FatalDependency(message),
            BrokerError::Unknown(message) => credsync_core::SyncError::FatalDependency(message),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rdkafka::error::KafkaError;
    use rdkafka::types::RDKafkaErrorCode;

    #[test]
    fn timeout_is_transient() {
        let err = KafkaError::AdminOpCreation("request timed out".into());
        assert!(matches!(BrokerError::classify(&err), BrokerError::Transient(_)));
    }

    #[test]
    fn unsupported_version_is_fatal() {
        let err = KafkaError::AdminOpCreation("unsupported version for this request".into());
        assert!(matches!(BrokerError::classify(&err), BrokerError::Fatal(_)));
    }

    #[test]
    fn anything_else_is_unknown() {
        let err = KafkaError::Global(RDKafkaErrorCode::UnknownMemberId);
        assert!(matches!(BrokerError::classify(&err), BrokerError::Unknown(_)));
    }
}
