use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use credsync_backend::audit::SqliteAuditStore;
use credsync_backend::settings::{OverflowPolicy as SettingsOverflowPolicy, Settings};
use credsync_backend::RetentionPurger;
use credsync_broker::client::{BrokerScramClient, RdKafkaScramClient};
use credsync_core::audit::BatchSource;
use credsync_core::{Principal, ScramMechanism};
use credsync_idp::diff::DiffOptions;
use credsync_idp::enumerator::KeycloakUserEnumerator;
use credsync_reconcile::api::{ApiState, BasicAuthConfig};
use credsync_reconcile::breakers::DependencyBreakers;
use credsync_reconcile::orchestrator::{OrchestratorConfig, ReconciliationOrchestrator};
use credsync_reconcile::queue::{DefaultEventMapper, EventQueue, OverflowPolicy as QueueOverflowPolicy, QueueConfig};

/// Startup failure: config validation or schema migration.
const EXIT_STARTUP_FAILURE: i32 = 1;
/// Unrecoverable runtime failure once the agent was already serving traffic.
const EXIT_RUNTIME_FAILURE: i32 = 2;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Directly upsert one SCRAM credential at the broker, bypassing the
    /// queue and the orchestrator — an admin override, not the normal
    /// sync path.
    AddUser {
        realm: String,
        username: String,
        password: String,
    },
    /// Directly delete a principal's SCRAM credential at the broker.
    RemoveUser { realm: String, username: String },
    /// Ask a running agent's Control API to run one reconciliation pass.
    TriggerReconcile {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api_base_url: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = match Settings::init() {
        Ok(settings) => settings,
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    };

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::AddUser { realm, username, password }) => {
            run_add_user(&settings, realm, username, password).await
        }
        Some(Commands::RemoveUser { realm, username }) => run_remove_user(&settings, realm, username).await,
        Some(Commands::TriggerReconcile { api_base_url }) => run_trigger_reconcile(&api_base_url).await,
        None => run_agent(settings).await,
    };

    if let Err(err) = result {
        error!(%err, "fatal error");
        std::process::exit(EXIT_RUNTIME_FAILURE);
    }
}

async fn run_add_user(settings: &Settings, realm: String, username: String, password: String) -> anyhow::Result<()> {
    let broker = build_broker_client(settings)?;
    let principal = Principal::new(realm, username);
    let verifier = credsync_core::verifier::generate(&password, ScramMechanism::Sha256, credsync_core::verifier::MIN_ITERATIONS)?;
    broker.upsert(principal, verifier).await?;
    info!("credential upserted");
    Ok(())
}

async fn run_remove_user(settings: &Settings, realm: String, username: String) -> anyhow::Result<()> {
    let broker = build_broker_client(settings)?;
    let principal = Principal::new(realm, username);
    broker.delete(principal, ScramMechanism::Sha256).await?;
    info!("credential deleted");
    Ok(())
}

async fn run_trigger_reconcile(api_base_url: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let response = client.post(format!("{api_base_url}/api/reconcile/trigger")).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        println!("{body}");
        Ok(())
    } else {
        Err(anyhow::anyhow!("reconcile trigger failed ({status}): {body}"))
    }
}

fn build_broker_client(settings: &Settings) -> anyhow::Result<RdKafkaScramClient> {
    RdKafkaScramClient::new(
        &settings.broker.bootstrap_servers,
        settings.broker.sasl_mechanism.as_deref(),
        settings.broker.sasl_username.as_deref(),
        settings.broker.sasl_password.as_deref(),
        Duration::from_millis(settings.broker.request_timeout_ms),
        settings.cluster_id.clone(),
    )
    .map_err(|err| anyhow::anyhow!(err))
}

/// Fetches a bearer token from the IdP's OpenID Connect token endpoint,
/// using client-credentials if a client secret is configured, falling
/// back to resource-owner password credentials otherwise — both are
/// Keycloak's standard grant shapes for a service-account-style caller.
async fn fetch_idp_token(client: &reqwest::Client, settings: &Settings) -> anyhow::Result<String> {
    let idp = &settings.idp;
    let url = format!("{}/realms/{}/protocol/openid-connect/token", idp.url, idp.realm);

    let mut form = vec![("client_id", idp.client_id.clone())];
    if let Some(secret) = &idp.client_secret {
        form.push(("client_secret", secret.clone()));
        form.push(("grant_type", "client_credentials".to_string()));
    } else {
        form.push(("grant_type", "password".to_string()));
        form.push(("username", idp.username.clone().unwrap_or_default()));
        form.push(("password", idp.password.clone().unwrap_or_default()));
    }

    #[derive(serde::Deserialize)]
    struct TokenResponse {
        access_token: String,
    }

    let response = client
        .post(url)
        .form(&form)
        .timeout(Duration::from_millis(idp.connect_timeout_ms))
        .send()
        .await?
        .error_for_status()?;
    let token: TokenResponse = response.json().await?;
    Ok(token.access_token)
}

fn to_queue_overflow(policy: SettingsOverflowPolicy) -> QueueOverflowPolicy {
    match policy {
        SettingsOverflowPolicy::Reject => QueueOverflowPolicy::Reject,
        SettingsOverflowPolicy::DropOldest => QueueOverflowPolicy::DropOldest,
    }
}

async fn run_agent(settings: Settings) -> anyhow::Result<()> {
    let audit = Arc::new(match SqliteAuditStore::new(&settings).await {
        Ok(store) => store,
        Err(err) => {
            error!(%err, "failed to open audit store / run migrations");
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    });

    let purger = Arc::new(RetentionPurger::new(audit.clone()));

    let broker = Arc::new(match build_broker_client(&settings) {
        Ok(broker) => broker,
        Err(err) => {
            error!(%err, "failed to construct broker client");
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    });

    let http_client = reqwest::Client::new();
    let bearer_token = match fetch_idp_token(&http_client, &settings).await {
        Ok(token) => token,
        Err(err) => {
            error!(%err, "failed to obtain idp token");
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    };

    let enumerator = Arc::new(KeycloakUserEnumerator::new(
        http_client.clone(),
        settings.idp.url.clone(),
        settings.idp.realm.clone(),
        bearer_token,
        settings.reconcile.page_size,
        credsync_idp::user::DEFAULT_SERVICE_PREFIXES.iter().map(|s| s.to_string()).collect(),
    ));

    let breakers = Arc::new(DependencyBreakers::default());

    let orchestrator = Arc::new(ReconciliationOrchestrator::new(
        enumerator,
        broker.clone(),
        audit.clone(),
        purger.clone(),
        breakers.clone(),
        OrchestratorConfig {
            realm: settings.idp.realm.clone(),
            cluster_id: settings.cluster_id.clone(),
            mechanism: ScramMechanism::Sha256,
            iterations: credsync_core::verifier::MIN_ITERATIONS,
            diff_options: DiffOptions {
                always_upsert: settings.reconcile.always_upsert,
                excluded: settings.reconcile.excluded_principals.clone(),
                dry_run: false,
            },
        },
    ));

    let queue = EventQueue::new(QueueConfig {
        capacity: settings.queue.capacity,
        workers: settings.queue.workers,
        overflow_policy: to_queue_overflow(settings.queue.overflow),
    });
    let mapper = Arc::new(DefaultEventMapper {
        realm: settings.idp.realm.clone(),
        mechanism: ScramMechanism::Sha256,
        iterations: credsync_core::verifier::MIN_ITERATIONS,
    });
    let worker_handles = queue.spawn_workers(mapper, broker.clone(), audit.clone(), settings.cluster_id.clone());

    if settings.reconcile.scheduler_enabled {
        let orchestrator = orchestrator.clone();
        let interval = Duration::from_secs(settings.reconcile.interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match orchestrator.run(BatchSource::Scheduled).await {
                    Ok(result) => info!(correlation_id = %result.correlation_id, "scheduled reconciliation complete"),
                    Err(credsync_core::SyncError::AlreadyRunning) => {
                        warn!("scheduled reconciliation skipped: a run is already in progress")
                    }
                    Err(err) => error!(%err, "scheduled reconciliation failed"),
                }
            }
        });
    }

    {
        let purger = purger.clone();
        let interval = Duration::from_secs(settings.retention.purge_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = purger.run("scheduled").await {
                    error!(%err, "scheduled retention purge failed");
                }
            }
        });
    }

    let basic_auth = match (&settings.basic_auth_username, &settings.basic_auth_password) {
        (Some(username), Some(password)) => BasicAuthConfig {
            credential: Some((username.clone(), password.clone())),
            protect_metrics: false,
        },
        _ => BasicAuthConfig::default(),
    };

    let depth_queue = queue.clone();
    let api_state = ApiState {
        orchestrator,
        audit: audit.clone(),
        breakers,
        queue_metrics: Some(queue.metrics_handle()),
        queue_depth: Some(Arc::new(move || depth_queue.depth())),
        basic_auth,
    };

    let router = credsync_reconcile::api::build_router(api_state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!(addr = %settings.bind_addr, "control api listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let shutdown_grace = Duration::from_secs(settings.queue.shutdown_grace_seconds);
    info!(grace_seconds = shutdown_grace.as_secs(), "draining event queue before exit");
    tokio::time::sleep(shutdown_grace).await;
    for handle in worker_handles {
        handle.abort();
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
