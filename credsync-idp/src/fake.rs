use std::sync::Mutex;

use crate::enumerator::UserEnumerator;
use crate::error::IdpError;
use crate::user::IdpUser;

/// In-memory [`UserEnumerator`] for orchestrator/queue tests, mirroring
/// `credsync_broker::fake::FakeBrokerScramClient`.
#[derive(Default)]
pub struct FakeUserEnumerator {
    users: Mutex<Vec<IdpUser>>,
    fail_next: Mutex<Option<IdpError>>,
}

impl FakeUserEnumerator {
    pub fn new(users: Vec<IdpUser>) -> Self {
        Self {
            users: Mutex::new(users),
            fail_next: Mutex::new(None),
        }
    }

    pub fn fail_next_call(&self, error: IdpError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }
}

impl UserEnumerator for FakeUserEnumerator {
    async fn fetch_all(&self) -> Result<Vec<IdpUser>, IdpError> {
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.users.lock().unwrap().clone())
    }
}
