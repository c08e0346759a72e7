pub mod diff;
pub mod enumerator;
pub mod error;
pub mod fake;
pub mod user;

pub use diff::{DiffOptions, SyncPlan, diff};
pub use enumerator::{KeycloakUserEnumerator, UserEnumerator};
pub use error::IdpError;
pub use user::IdpUser;
