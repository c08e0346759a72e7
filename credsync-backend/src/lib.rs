pub mod audit;
pub mod retention;
pub mod settings;

pub use audit::{AuditStore, SqliteAuditStore};
pub use retention::RetentionPurger;
pub use settings::Settings;
