pub mod config;
pub mod correlation;
pub mod interceptor;
pub mod subscriber;

pub use config::PluginConfig;
pub use correlation::{CorrelationGuard, CorrelationStore};
pub use interceptor::{HostPasswordHasher, PasswordHashInterceptor};
pub use subscriber::{HostUserLookup, SkipReason, SubscriberOutcome, handle_admin_event};
