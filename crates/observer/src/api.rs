//! HTTP API serving the aggregated views, health checks and Prometheus metrics

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use observer_lib::{
    control_plane::ControlPlaneSnapshot,
    cost::{CostQuery, CostSnapshot, CostSummary},
    health::{ComponentStatus, HealthRegistry},
    insights::InsightSnapshot,
    metrics::{MetricsSnapshot, SeriesView},
    trace::TraceSnapshot,
    AggregationStore, CostRecord, Insight, InsightCategory, RunKey, Severity,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub store: Arc<AggregationStore>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, store: Arc<AggregationStore>) -> Self {
        Self {
            health_registry,
            store,
        }
    }
}

/// A view payload with the time its snapshot was published
#[derive(Serialize)]
struct ViewResponse<T> {
    published_at: DateTime<Utc>,
    data: T,
}

fn view<T: Serialize>(published_at: DateTime<Utc>, data: T) -> Response {
    Json(ViewResponse { published_at, data }).into_response()
}

fn not_yet_available() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "status": "not_yet_available" })),
    )
        .into_response()
}

fn not_found(what: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "status": "not_found", "id": what })),
    )
        .into_response()
}

fn bad_request(reason: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "bad_request", "reason": reason })),
    )
        .into_response()
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
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
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Publish time of every view
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.status())
}

#[derive(Debug, Default, Deserialize)]
pub struct SeriesQuery {
    pub name: Option<String>,
    pub pipeline: Option<String>,
    pub task: Option<String>,
}

#[derive(Serialize)]
struct MetricsView<'a> {
    scraped_at: Option<DateTime<Utc>>,
    sample_count: usize,
    skipped_lines: usize,
    series: Vec<&'a SeriesView>,
}

async fn metrics_view(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SeriesQuery>,
) -> Response {
    let Some(published) = state.store.read::<MetricsSnapshot>() else {
        return not_yet_available();
    };
    let snapshot = &published.snapshot;

    let label_is = |series: &SeriesView, key: &str, wanted: &Option<String>| match wanted {
        Some(w) => series.labels.get(key) == Some(w),
        None => true,
    };
    let series = snapshot
        .series
        .iter()
        .filter(|s| query.name.as_ref().map_or(true, |n| &s.name == n))
        .filter(|s| label_is(*s, "pipeline", &query.pipeline))
        .filter(|s| label_is(*s, "task", &query.task))
        .collect();

    view(
        published.published_at,
        MetricsView {
            scraped_at: snapshot.scraped_at,
            sample_count: snapshot.sample_count,
            skipped_lines: snapshot.skipped_lines,
            series,
        },
    )
}

#[derive(Serialize)]
struct CostView<'a> {
    summary: CostSummary,
    runs: Vec<&'a CostRecord>,
}

async fn costs(State(state): State<Arc<AppState>>, Query(query): Query<CostQuery>) -> Response {
    let Some(published) = state.store.read::<CostSnapshot>() else {
        return not_yet_available();
    };
    let snapshot = &published.snapshot;

    view(
        published.published_at,
        CostView {
            summary: snapshot.aggregate(&query),
            runs: snapshot.records.values().filter(|r| query.matches(r)).collect(),
        },
    )
}

async fn run_cost(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let Some(published) = state.store.read::<CostSnapshot>() else {
        return not_yet_available();
    };

    let key = RunKey::new(namespace, name);
    match published.snapshot.run(&key) {
        Some(record) => view(published.published_at, record),
        None => not_found(key.to_string()),
    }
}

async fn traces(State(state): State<Arc<AppState>>) -> Response {
    match state.store.read::<TraceSnapshot>() {
        Some(published) => view(published.published_at, published.snapshot.list()),
        None => not_yet_available(),
    }
}

async fn trace(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let Some(published) = state.store.read::<TraceSnapshot>() else {
        return not_yet_available();
    };

    let id = RunKey::new(namespace, name).to_string();
    match published.snapshot.get(&id) {
        Some(trace) => view(published.published_at, trace),
        None => not_found(id),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct InsightQuery {
    pub category: Option<String>,
    pub severity: Option<String>,
}

#[derive(Serialize)]
struct InsightView<'a> {
    generated_at: Option<DateTime<Utc>>,
    insights: Vec<&'a Insight>,
}

async fn insights(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InsightQuery>,
) -> Response {
    let category = match query.category.as_deref().map(str::parse::<InsightCategory>) {
        Some(Err(e)) => return bad_request(e),
        parsed => parsed.and_then(Result::ok),
    };
    let severity = match query.severity.as_deref().map(str::parse::<Severity>) {
        Some(Err(e)) => return bad_request(e),
        parsed => parsed.and_then(Result::ok),
    };

    let Some(published) = state.store.read::<InsightSnapshot>() else {
        return not_yet_available();
    };

    view(
        published.published_at,
        InsightView {
            generated_at: published.snapshot.generated_at,
            insights: published.snapshot.filter(category, severity),
        },
    )
}

async fn control_plane(State(state): State<Arc<AppState>>) -> Response {
    match state.store.read::<ControlPlaneSnapshot>() {
        Some(published) => view(published.published_at, &published.snapshot.components),
        None => not_yet_available(),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/status", get(status))
        .route("/api/v1/metrics", get(metrics_view))
        .route("/api/v1/costs", get(costs))
        .route("/api/v1/costs/:namespace/:name", get(run_cost))
        .route("/api/v1/traces", get(traces))
        .route("/api/v1/traces/:namespace/:name", get(trace))
        .route("/api/v1/insights", get(insights))
        .route("/api/v1/controlplane", get(control_plane))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
