//! HTTP control surface
//!
//! Triggers apply/delete cycles and renders graph views. No graph logic lives
//! here; every route delegates to the [`Reconciler`].

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use topoguard_lib::{
    health::{ComponentStatus, HealthRegistry},
    ApplyOptions, CycleReport, InstanceSource, Reconciler, TopologyError,
};
use tracing::{error, info};

const DOT_CONTENT_TYPE: &str = "text/vnd.graphviz; charset=utf-8";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub health_registry: HealthRegistry,
    /// Used when an apply request names no source
    pub default_source: InstanceSource,
    /// Cancelled on process shutdown; in-flight cycles stop with it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>, health_registry: HealthRegistry) -> Self {
        Self {
            reconciler,
            health_registry,
            default_source: InstanceSource::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_default_source(mut self, source: InstanceSource) -> Self {
        self.default_source = source;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Error response with a JSON body
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

impl From<TopologyError> for ApiError {
    fn from(e: TopologyError) -> Self {
        let status = match e {
            TopologyError::CycleInProgress => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum GraphFormat {
    #[default]
    Json,
    Dot,
}

#[derive(Debug, Default, Deserialize)]
struct ApplyParams {
    source: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Default, Deserialize)]
struct GraphParams {
    source: Option<String>,
    #[serde(default)]
    format: GraphFormat,
}

fn parse_source(raw: Option<&str>, default: InstanceSource) -> Result<InstanceSource, ApiError> {
    match raw {
        None => Ok(default),
        Some(raw) => {
            InstanceSource::from_str(raw).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e))
        }
    }
}

/// 200 when every document landed, 207 when some were rejected or a
/// cancelled cycle could not roll back
fn cycle_response(report: CycleReport) -> Response {
    let status = if report.failed.is_empty() && report.rollback_error.is_none() {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    (status, Json(report)).into_response()
}

async fn finish_cycle(
    state: &AppState,
    outcome: topoguard_lib::Result<CycleReport>,
) -> Result<Response, ApiError> {
    match outcome {
        Ok(report) => {
            state.health_registry.observe_cycle(&report).await;
            Ok(cycle_response(report))
        }
        Err(e) => {
            if !matches!(e, TopologyError::CycleInProgress) {
                error!(error = %e, "Reconciliation cycle failed");
            }
            state.health_registry.observe_failure(&e).await;
            Err(e.into())
        }
    }
}

async fn apply(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ApplyParams>,
) -> Result<Response, ApiError> {
    let source = parse_source(params.source.as_deref(), state.default_source)?;
    let options = ApplyOptions {
        source,
        dry_run: params.dry_run,
    };
    let outcome = state
        .reconciler
        .apply_until(options, state.shutdown.clone())
        .await;
    finish_cycle(&state, outcome).await
}

async fn delete(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let outcome = state.reconciler.delete().await;
    finish_cycle(&state, outcome).await
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cancelled = state.reconciler.cancel().await;
    Json(CancelResponse { cancelled })
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.reconciler.status().await)
}

#[derive(Debug, Serialize)]
struct PoliciesResponse {
    namespace: String,
    policies: Vec<String>,
}

async fn policies(State(state): State<Arc<AppState>>) -> Result<Json<PoliciesResponse>, ApiError> {
    let policies = state.reconciler.enforced_policies().await?;
    Ok(Json(PoliciesResponse {
        namespace: state.reconciler.namespace().to_string(),
        policies,
    }))
}

async fn service_graph(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GraphParams>,
) -> Response {
    let topology = state.reconciler.topology();
    match params.format {
        GraphFormat::Json => Json(topology.graph.view(&topology.identity)).into_response(),
        GraphFormat::Dot => (
            [(header::CONTENT_TYPE, DOT_CONTENT_TYPE)],
            topology.graph.to_dot(),
        )
            .into_response(),
    }
}

async fn endpoint_graph(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GraphParams>,
) -> Result<Response, ApiError> {
    let source = parse_source(params.source.as_deref(), state.default_source)?;
    let (graph, instances) = state.reconciler.resolve_endpoints(source).await;
    Ok(match params.format {
        GraphFormat::Json => Json(graph.view(&instances)).into_response(),
        GraphFormat::Dot => {
            ([(header::CONTENT_TYPE, DOT_CONTENT_TYPE)], graph.to_dot()).into_response()
        }
    })
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 once the static graph is built
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/apply", post(apply))
        .route("/delete", post(delete))
        .route("/cancel", post(cancel))
        .route("/status", get(status))
        .route("/policies", get(policies))
        .route("/graph/services", get(service_graph))
        .route("/graph/endpoints", get(endpoint_graph))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
