use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::audit::OpType;

/// Password-reset sub-paths that carry a plaintext the same way a plain
/// `UPDATE` does.
pub const PASSWORD_RESET_SUBPATHS: &[&str] =
    &["reset-password", "reset-password-email", "execute-actions-email"];

/// Host-reported resource kind an admin event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    User,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

/// The event the host IdP hands to the Admin Event Subscriber / event
/// queue. `resource_path` has the shape `users/{id}[/...]` or
/// `clients/{id}[/...]`; unmatched paths are ignored by the resolver in
/// `credsync-plugin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminEvent {
    pub realm: String,
    pub resource_type: ResourceType,
    pub operation_type: OperationType,
    pub resource_path: String,
}

impl AdminEvent {
    /// Extracts the `{id}` segment from `resource_path`, the way the
    /// subscriber resolves `username` when the event itself doesn't
    /// carry one directly.
    pub fn resource_id(&self) -> Option<&str> {
        let mut segments = self.resource_path.split('/');
        let kind = segments.next()?;
        let expected = match self.resource_type {
            ResourceType::User => "users",
            ResourceType::Client => "clients",
        };
        if kind != expected {
            return None;
        }
        segments.next().filter(|id| !id.is_empty())
    }

    /// `true` if this event is a password-update candidate for the
    /// synchronous plug-in path: a `USER` `CREATE`/`UPDATE`, or a `USER`
    /// event whose path ends in one of [`PASSWORD_RESET_SUBPATHS`].
    pub fn is_password_update_candidate(&self) -> bool {
        if self.resource_type != ResourceType::User {
            return false;
        }
        if matches!(self.operation_type, OperationType::Create | OperationType::Update) {
            return true;
        }
        PASSWORD_RESET_SUBPATHS
            .iter()
            .any(|subpath| self.resource_path.ends_with(subpath))
    }

    /// The general resource-type policy: `USER DELETE -> SCRAM_DELETE`,
    /// `CLIENT {CREATE,UPDATE} -> SCRAM_UPSERT`, `CLIENT DELETE ->
    /// SCRAM_DELETE`. Consumed by the event queue's
    /// `EventMapper` (`credsync-reconcile::queue`) rather than by the
    /// synchronous password path, which only ever produces upserts.
    pub fn resource_type_policy(&self) -> Option<OpType> {
        match (self.resource_type, self.operation_type) {
            (ResourceType::User, OperationType::Delete) => Some(OpType::ScramDelete),
            (ResourceType::Client, OperationType::Create | OperationType::Update) => {
                Some(OpType::ScramUpsert)
            }
            (ResourceType::Client, OperationType::Delete) => Some(OpType::ScramDelete),
            (ResourceType::User, OperationType::Create | OperationType::Update) => None,
        }
    }
}

/// The queue element wrapping an [`AdminEvent`] with retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub correlation_id: String,
    pub admin_event: AdminEvent,
    pub enqueued_at_millis: i64,
    pub retry_count: u32,
    pub last_attempt_at_millis: Option<i64>,
}

impl EventEnvelope {
    pub fn new(correlation_id: String, admin_event: AdminEvent) -> Self {
        Self {
            correlation_id,
            admin_event,
            enqueued_at_millis: now_millis(),
            retry_count: 0,
            last_attempt_at_millis: None,
        }
    }

    /// Returns a copy with `retry_count` incremented and
    /// `last_attempt_at_millis` stamped, the shape re-enqueued on
    /// transient failure. Ordering across retries is not preserved: this
    /// envelope goes to the back of the queue.
    pub fn for_retry(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next.last_attempt_at_millis = Some(now_millis());
        next
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_event(path: &str) -> AdminEvent {
        AdminEvent {
            realm: "default".into(),
            resource_type: ResourceType::User,
            operation_type: OperationType::Update,
            resource_path: path.into(),
        }
    }

    #[test]
    fn resource_id_extracts_user_id() {
        let event = sample_event("users/abc-123/reset-password");
        assert_eq!(event.resource_id(), Some("abc-123"));
    }

    #[test]
    fn resource_id_none_for_mismatched_kind() {
        let event = sample_event("clients/abc-123");
        assert_eq!(event.resource_id(), None);
    }

    #[test]
    fn resource_id_none_when_missing() {
        let event = sample_event("users/");
        assert_eq!(event.resource_id(), None);
    }

    #[test]
    fn for_retry_increments_count_and_loses_position_semantically() {
        let envelope = EventEnvelope::new("corr-1".into(), sample_event("users/abc"));
        let retried = envelope.for_retry();
        assert_eq!(retried.retry_count, 1);
        assert!(retried.last_attempt_at_millis.is_some());
    }

    #[test]
    fn user_update_is_a_password_candidate() {
        assert!(sample_event("users/abc").is_password_update_candidate());
    }

    #[test]
    fn user_reset_password_subpath_is_a_candidate() {
        let event = sample_event("users/abc/reset-password");
        assert!(event.is_password_update_candidate());
    }

    #[test]
    fn user_delete_is_not_a_password_candidate() {
        let mut event = sample_event("users/abc");
        event.operation_type = OperationType::Delete;
        assert!(!event.is_password_update_candidate());
    }

    #[test]
    fn resource_type_policy_maps_each_combination() {
        let mut event = sample_event("users/abc");
        event.operation_type = OperationType::Delete;
        assert_eq!(event.resource_type_policy(), Some(OpType::ScramDelete));

        event.resource_type = ResourceType::Client;
        event.operation_type = OperationType::Create;
        assert_eq!(event.resource_type_policy(), Some(OpType::ScramUpsert));

        event.operation_type = OperationType::Delete;
        assert_eq!(event.resource_type_policy(), Some(OpType::ScramDelete));

        event.resource_type = ResourceType::User;
        event.operation_type = OperationType::Update;
        assert_eq!(event.resource_type_policy(), None);
    }
}
