use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use credsync_backend::audit::{AuditStore, OperationFilter, Page};
use credsync_broker::client::BrokerScramClient;
use credsync_core::SyncError;
use credsync_core::audit::{BatchSource, OpResult, OpType};
use credsync_idp::enumerator::UserEnumerator;

use crate::breakers::DependencyBreakers;
use crate::orchestrator::ReconciliationOrchestrator;
use crate::queue::QueueMetrics;

const ONE_HOUR_MILLIS: i64 = 60 * 60 * 1000;
const MAX_RETENTION_BYTES: i64 = 10 * 1024 * 1024 * 1024;
const MAX_RETENTION_AGE_DAYS: i64 = 3650;

/// HTTP basic-auth gate for `/api/*`. `None` means the surface is
/// unauthenticated, leaving auth entirely to the enclosing deployment.
#[derive(Clone, Default)]
pub struct BasicAuthConfig {
    pub credential: Option<(String, String)>,
    /// `/metrics` is normally exempt from auth; set true to protect it
    /// too.
    pub protect_metrics: bool,
}

/// Everything a route handler needs, generic over the same collaborator
/// types as [`ReconciliationOrchestrator`] so the Control API never
/// forces a concrete broker/IdP/storage implementation.
pub struct ApiState<E, B, S> {
    pub orchestrator: Arc<ReconciliationOrchestrator<E, B, S>>,
    pub audit: Arc<S>,
    pub breakers: Arc<DependencyBreakers>,
    pub queue_metrics: Option<Arc<QueueMetrics>>,
    pub queue_depth: Option<Arc<dyn Fn() -> usize + Send + Sync>>,
    pub basic_auth: BasicAuthConfig,
}

impl<E, B, S> Clone for ApiState<E, B, S> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            audit: self.audit.clone(),
            breakers: self.breakers.clone(),
            queue_metrics: self.queue_metrics.clone(),
            queue_depth: self.queue_depth.clone(),
            basic_auth: self.basic_auth.clone(),
        }
    }
}

/// Builds the full route table. `/healthz` and `/metrics`
/// (unless `protect_metrics` is set) sit outside the basic-auth layer;
/// every `/api/*` route sits behind it.
pub fn build_router<E, B, S>(state: ApiState<E, B, S>) -> Router
where
    E: UserEnumerator + Send + Sync + 'static,
    B: BrokerScramClient + Send + Sync + 'static,
    S: AuditStore + Send + Sync + 'static,
{
    let api_routes = Router::new()
        .route("/reconcile/trigger", post(trigger_reconcile::<E, B, S>))
        .route("/reconcile/status", get(reconcile_status::<E, B, S>))
        .route("/summary", get(summary::<E, B, S>))
        .route("/operations", get(list_operations::<E, B, S>))
        .route("/batches", get(list_batches::<E, B, S>))
        .route(
            "/config/retention",
            get(get_retention::<E, B, S>).put(put_retention::<E, B, S>),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            basic_auth_layer::<E, B, S>,
        ));

    let mut metrics_route = get(metrics::<E, B, S>);
    if state.basic_auth.protect_metrics {
        metrics_route = metrics_route.layer(middleware::from_fn_with_state(
            state.clone(),
            basic_auth_layer::<E, B, S>,
        ));
    }

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz::<E, B, S>))
        .route("/metrics", metrics_route)
        .nest("/api", api_routes)
        .with_state(state)
}

async fn basic_auth_layer<E, B, S>(
    State(state): State<ApiState<E, B, S>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let Some((username, password)) = &state.basic_auth.credential else {
        return next.run(request).await;
    };

    let authorized = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|decoded| decoded.split_once(':').map(|(u, p)| (u.to_string(), p.to_string())))
        .map(|(u, p)| &u == username && &p == password)
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        let mut response = error_response(SyncError::InvalidInput("missing or invalid credentials".into()));
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        response
            .headers_mut()
            .insert(axum::http::header::WWW_AUTHENTICATE, "Basic".parse().unwrap());
        response
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz<E, B, S>(State(state): State<ApiState<E, B, S>>) -> Response
where
    E: UserEnumerator,
    B: BrokerScramClient,
    S: AuditStore,
{
    let breakers_closed = state.breakers.all_closed();
    let storage_writable = state.audit.get_retention().await.is_ok();

    if breakers_closed && storage_writable {
        (StatusCode::OK, Json(json!({"ready": true}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "ready": false,
                "breakersClosed": breakers_closed,
                "storageWritable": storage_writable,
            })),
        )
            .into_response()
    }
}

async fn metrics<E, B, S>(State(state): State<ApiState<E, B, S>>) -> impl IntoResponse
where
    E: UserEnumerator,
    B: BrokerScramClient,
    S: AuditStore,
{
    let mut body = String::new();

    body.push_str("# HELP credsync_breaker_state Circuit breaker state (0=closed,1=open,2=half_open).\n");
    body.push_str("# TYPE credsync_breaker_state gauge\n");
    for breaker in [&state.breakers.idp, &state.breakers.broker] {
        let value = match breaker.state() {
            credsync_core::breaker::BreakerState::Closed => 0,
            credsync_core::breaker::BreakerState::Open => 1,
            credsync_core::breaker::BreakerState::HalfOpen => 2,
        };
        body.push_str(&format!(
            "credsync_breaker_state{{dependency=\"{}\"}} {}\n",
            breaker.name(),
            value
        ));
    }

    if let Some(metrics) = &state.queue_metrics {
        body.push_str("# HELP credsync_queue_dropped_total Events dropped by the overflow policy.\n");
        body.push_str("# TYPE credsync_queue_dropped_total counter\n");
        body.push_str(&format!("credsync_queue_dropped_total {}\n", metrics.dropped()));

        body.push_str("# HELP credsync_queue_scheduled_retries_total Retries scheduled after processing failure.\n");
        body.push_str("# TYPE credsync_queue_scheduled_retries_total counter\n");
        body.push_str(&format!(
            "credsync_queue_scheduled_retries_total {}\n",
            metrics.scheduled_retries()
        ));

        body.push_str("# HELP credsync_queue_terminal_failures_total Events dropped after exhausting retries.\n");
        body.push_str("# TYPE credsync_queue_terminal_failures_total counter\n");
        body.push_str(&format!(
            "credsync_queue_terminal_failures_total {}\n",
            metrics.terminal_failures()
        ));
    }

    if let Some(depth_fn) = &state.queue_depth {
        body.push_str("# HELP credsync_queue_depth Current depth of the event queue.\n");
        body.push_str("# TYPE credsync_queue_depth gauge\n");
        body.push_str(&format!("credsync_queue_depth {}\n", depth_fn()));
    }

    body.push_str("# HELP credsync_reconcile_running Whether a reconciliation run is in progress.\n");
    body.push_str("# TYPE credsync_reconcile_running gauge\n");
    body.push_str(&format!(
        "credsync_reconcile_running {}\n",
        if state.orchestrator.is_running() { 1 } else { 0 }
    ));

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    correlation_id: String,
    duration_ms: i64,
    totals: Totals,
}

#[derive(Debug, Serialize)]
struct Totals {
    success: u64,
    error: u64,
    skipped: u64,
}

async fn trigger_reconcile<E, B, S>(State(state): State<ApiState<E, B, S>>) -> Response
where
    E: UserEnumerator,
    B: BrokerScramClient,
    S: AuditStore,
{
    match state.orchestrator.run(BatchSource::Manual).await {
        Ok(result) => (
            StatusCode::ACCEPTED,
            Json(TriggerResponse {
                correlation_id: result.correlation_id,
                duration_ms: result.duration_ms,
                totals: Totals {
                    success: result.success,
                    error: result.error,
                    skipped: result.skipped,
                },
            }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    running: bool,
}

async fn reconcile_status<E, B, S>(State(state): State<ApiState<E, B, S>>) -> Json<StatusResponse>
where
    E: UserEnumerator,
    B: BrokerScramClient,
    S: AuditStore,
{
    Json(StatusResponse {
        running: state.orchestrator.is_running(),
    })
}

async fn summary<E, B, S>(State(state): State<ApiState<E, B, S>>) -> Response
where
    E: UserEnumerator,
    B: BrokerScramClient,
    S: AuditStore,
{
    match state.audit.rolling_summary(ONE_HOUR_MILLIS, now_millis()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => error_response(SyncError::InternalInvariant(err.to_string())),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationsQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    start_time: Option<i64>,
    end_time: Option<i64>,
    principal: Option<String>,
    op_type: Option<String>,
    result: Option<String>,
}

fn parse_op_type(raw: &str) -> Result<OpType, SyncError> {
    match raw {
        "SCRAM_UPSERT" => Ok(OpType::ScramUpsert),
        "SCRAM_DELETE" => Ok(OpType::ScramDelete),
        other => Err(SyncError::InvalidInput(format!("unknown opType `{other}`"))),
    }
}

fn parse_result(raw: &str) -> Result<OpResult, SyncError> {
    match raw {
        "SUCCESS" => Ok(OpResult::Success),
        "ERROR" => Ok(OpResult::Error),
        "SKIPPED" => Ok(OpResult::Skipped),
        other => Err(SyncError::InvalidInput(format!("unknown result `{other}`"))),
    }
}

async fn list_operations<E, B, S>(
    State(state): State<ApiState<E, B, S>>,
    Query(params): Query<OperationsQuery>,
) -> Response
where
    E: UserEnumerator,
    B: BrokerScramClient,
    S: AuditStore,
{
    let op_type = match params.op_type.as_deref().map(parse_op_type).transpose() {
        Ok(value) => value,
        Err(err) => return error_response(err),
    };
    let result = match params.result.as_deref().map(parse_result).transpose() {
        Ok(value) => value,
        Err(err) => return error_response(err),
    };

    let filter = OperationFilter {
        start_time_millis: params.start_time,
        end_time_millis: params.end_time,
        principal: params.principal,
        op_type,
        result,
    };
    let page = Page {
        page: params.page.unwrap_or(1).max(1),
        page_size: params.page_size.unwrap_or(50).clamp(1, 500),
    };

    match state.audit.list_operations(&filter, page).await {
        Ok(operations) => Json(json!({ "items": operations, "page": page.page, "pageSize": page.page_size }))
            .into_response(),
        Err(err) => error_response(SyncError::InternalInvariant(err.to_string())),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

async fn list_batches<E, B, S>(
    State(state): State<ApiState<E, B, S>>,
    Query(params): Query<PageQuery>,
) -> Response
where
    E: UserEnumerator,
    B: BrokerScramClient,
    S: AuditStore,
{
    let page = Page {
        page: params.page.unwrap_or(1).max(1),
        page_size: params.page_size.unwrap_or(50).clamp(1, 500),
    };

    match state.audit.list_batches(page).await {
        Ok(batches) => Json(json!({ "items": batches, "page": page.page, "pageSize": page.page_size })).into_response(),
        Err(err) => error_response(SyncError::InternalInvariant(err.to_string())),
    }
}

async fn get_retention<E, B, S>(State(state): State<ApiState<E, B, S>>) -> Response
where
    E: UserEnumerator,
    B: BrokerScramClient,
    S: AuditStore,
{
    match state.audit.get_retention().await {
        Ok(policy) => Json(policy).into_response(),
        Err(err) => error_response(SyncError::InternalInvariant(err.to_string())),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetentionUpdateRequest {
    max_bytes: Option<i64>,
    max_age_days: Option<i64>,
}

async fn put_retention<E, B, S>(
    State(state): State<ApiState<E, B, S>>,
    Json(body): Json<RetentionUpdateRequest>,
) -> Response
where
    E: UserEnumerator,
    B: BrokerScramClient,
    S: AuditStore,
{
    if let Some(max_bytes) = body.max_bytes {
        if !(0..=MAX_RETENTION_BYTES).contains(&max_bytes) {
            return error_response(SyncError::InvalidInput(format!(
                "maxBytes must be within [0, {MAX_RETENTION_BYTES}], got {max_bytes}"
            )));
        }
    }
    if let Some(max_age_days) = body.max_age_days {
        if !(0..=MAX_RETENTION_AGE_DAYS).contains(&max_age_days) {
            return error_response(SyncError::InvalidInput(format!(
                "maxAgeDays must be within [0, {MAX_RETENTION_AGE_DAYS}], got {max_age_days}"
            )));
        }
    }

    match state
        .audit
        .update_retention(body.max_bytes, body.max_age_days, now_millis())
        .await
    {
        Ok(policy) => Json(policy).into_response(),
        Err(err) => error_response(SyncError::InternalInvariant(err.to_string())),
    }
}

/// Maps a [`SyncError`] onto the `{code, message}` envelope and its
/// matching HTTP status.
pub fn error_response(err: SyncError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({ "code": err.code(), "message": err.to_string() })),
    )
        .into_response()
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
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use credsync_backend::RetentionPurger;
    use credsync_backend::audit::SqliteAuditStore;
    use credsync_broker::fake::FakeBrokerScramClient;
    use credsync_idp::fake::FakeUserEnumerator;

    use crate::orchestrator::OrchestratorConfig;
    use credsync_core::ScramMechanism;
    use credsync_idp::diff::DiffOptions;

    type TestOrchestrator = ReconciliationOrchestrator<FakeUserEnumerator, FakeBrokerScramClient, SqliteAuditStore>;

    async fn test_state() -> ApiState<FakeUserEnumerator, FakeBrokerScramClient, SqliteAuditStore> {
        let audit = Arc::new(SqliteAuditStore::in_memory().await.unwrap());
        let purger = Arc::new(RetentionPurger::new(audit.clone()));
        let orchestrator: Arc<TestOrchestrator> = Arc::new(ReconciliationOrchestrator::new(
            Arc::new(FakeUserEnumerator::new(vec![])),
            Arc::new(FakeBrokerScramClient::new()),
            audit.clone(),
            purger,
            Arc::new(DependencyBreakers::default()),
            OrchestratorConfig {
                realm: "default".into(),
                cluster_id: "cluster-1".into(),
                mechanism: ScramMechanism::Sha256,
                iterations: 4096,
                diff_options: DiffOptions::default(),
            },
        ));

        ApiState {
            orchestrator,
            audit,
            breakers: Arc::new(DependencyBreakers::default()),
            queue_metrics: None,
            queue_depth: None,
            basic_auth: BasicAuthConfig::default(),
        }
    }

    #[tokio::test]
    async fn healthz_is_always_200() {
        let router = build_router(test_state().await);
        let response = router
            .oneshot(HttpRequest::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_is_200_when_breakers_closed() {
        let router = build_router(test_state().await);
        let response = router
            .oneshot(HttpRequest::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trigger_then_status_reports_running_false_after_completion() {
        let router = build_router(test_state().await);
        let response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/reconcile/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let status_response = router
            .oneshot(HttpRequest::builder().uri("/api/reconcile/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(status_response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_route_without_credentials_is_401() {
        let mut state = test_state().await;
        state.basic_auth.credential = Some(("admin".to_string(), "secret".to_string()));
        let router = build_router(state);

        let response = router
            .oneshot(HttpRequest::builder().uri("/api/reconcile/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(axum::http::header::WWW_AUTHENTICATE).is_some());
    }

    #[tokio::test]
    async fn protected_route_with_valid_credentials_succeeds() {
        let mut state = test_state().await;
        state.basic_auth.credential = Some(("admin".to_string(), "secret".to_string()));
        let router = build_router(state);

        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:secret");
        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/reconcile/status")
                    .header(axum::http::header::AUTHORIZATION, format!("Basic {encoded}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn healthz_is_exempt_from_basic_auth() {
        let mut state = test_state().await;
        state.basic_auth.credential = Some(("admin".to_string(), "secret".to_string()));
        let router = build_router(state);

        let response = router
            .oneshot(HttpRequest::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn retention_put_rejects_out_of_range_max_bytes() {
        let router = build_router(test_state().await);
        let response = router
            .oneshot(
                HttpRequest::builder()
                    .method("PUT")
                    .uri("/api/config/retention")
                    .header(axum::http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"maxBytes": -1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn retention_get_then_put_round_trips() {
        let router = build_router(test_state().await);
        let put_response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("PUT")
                    .uri("/api/config/retention")
                    .header(axum::http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"maxBytes": 1024, "maxAgeDays": 30}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(put_response.status(), StatusCode::OK);

        let get_response = router
            .oneshot(HttpRequest::builder().uri("/api/config/retention").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(get_response.status(), StatusCode::OK);
    }
}
