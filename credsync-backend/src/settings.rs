use anyhow::{Error, anyhow};
use serde::Deserialize;

/// Layered configuration built from a `config::Config::builder()` chain:
/// file defaults, file overrides, then environment variables win.
/// Environment variables use the `CREDSYNC__SECTION__FIELD` shape.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub basic_auth_username: Option<String>,
    #[serde(default)]
    pub basic_auth_password: Option<String>,
    pub broker: BrokerSettings,
    pub idp: IdpSettings,
    pub reconcile: ReconcileSettings,
    pub retention: RetentionSettings,
    pub queue: QueueSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSettings {
    pub bootstrap_servers: String,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    #[serde(default = "default_broker_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_broker_api_timeout_ms")]
    pub default_api_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdpSettings {
    pub url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_idp_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_idp_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileSettings {
    #[serde(default)]
    pub scheduler_enabled: bool,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_always_upsert")]
    pub always_upsert: bool,
    #[serde(default)]
    pub excluded_principals: Vec<String>,
    #[serde(default)]
    pub realm_allowlist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionSettings {
    pub max_bytes: Option<i64>,
    pub max_age_days: Option<i64>,
    #[serde(default = "default_purge_interval_seconds")]
    pub purge_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub enum OverflowPolicy {
    #[default]
    #[serde(rename = "REJECT")]
    Reject,
    #[serde(rename = "DROP_OLDEST")]
    DropOldest,
}

fn default_broker_request_timeout_ms() -> u64 {
    30_000
}
fn default_broker_api_timeout_ms() -> u64 {
    60_000
}
fn default_idp_connect_timeout_ms() -> u64 {
    10_000
}
fn default_idp_read_timeout_ms() -> u64 {
    30_000
}
fn default_interval_seconds() -> u64 {
    120
}
fn default_page_size() -> u32 {
    500
}
fn default_always_upsert() -> bool {
    true
}
fn default_purge_interval_seconds() -> u64 {
    300
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_workers() -> usize {
    2
}
fn default_shutdown_grace_seconds() -> u64 {
    30
}
fn default_cluster_id() -> String {
    "default".to_string()
}
fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Settings {
    pub fn init() -> Result<Self, Error> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/defaults").required(false))
            .add_source(config::File::with_name("config/overrides").required(false))
            .add_source(config::Environment::with_prefix("CREDSYNC").separator("__"))
            .build()?;

        settings.try_deserialize().map_err(|e| anyhow!(e))
    }
}
