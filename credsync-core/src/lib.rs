pub mod audit;
pub mod breaker;
pub mod error;
pub mod event;
pub mod principal;
pub mod verifier;

pub use error::SyncError;
pub use principal::Principal;
pub use verifier::{ScramMechanism, ScramVerifier};
