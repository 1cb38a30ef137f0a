//! Integration tests for the observer API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use observer_lib::{
    control_plane::ControlPlaneSnapshot,
    cost::CostSnapshot,
    health::{components, HealthRegistry},
    insights::InsightSnapshot,
    observability::ObserverMetrics,
    trace::TraceSnapshot,
    AggregationStore, ControlPlaneStatus, CostRecord, DependencySource, Insight, InsightCategory,
    RateTable, ReadinessState, RunKey, RunStatus, Severity, Span, Trace,
};
use pipeline_observer::api::{create_router, AppState};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + Duration::seconds(secs)
}

async fn setup_test_app() -> (Router, Arc<AggregationStore>, HealthRegistry) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::METRICS_COLLECTOR).await;
    health_registry.register(components::TRACE_COLLECTOR).await;

    let _metrics = ObserverMetrics::new();
    let store = Arc::new(AggregationStore::new());
    let state = Arc::new(AppState::new(health_registry.clone(), Arc::clone(&store)));

    (create_router(state), store, health_registry)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn cost_record(namespace: &str, name: &str, total_cost: f64, started: i64) -> CostRecord {
    CostRecord {
        key: RunKey::new(namespace, name),
        pipeline: "build".to_string(),
        status: RunStatus::Succeeded,
        started_at: Some(at(started)),
        task_seconds: 3600.0,
        cpu_seconds: 3600.0,
        memory_byte_seconds: 0.0,
        storage_byte_seconds: 0.0,
        requested_cpu_seconds: 3600.0,
        requested_memory_byte_seconds: 0.0,
        cpu_cost: total_cost,
        memory_cost: 0.0,
        storage_cost: 0.0,
        total_cost,
        rates: RateTable {
            cpu_hour: total_cost,
            memory_gb_hour: 0.0,
            storage_gb_hour: 0.0,
        },
        first_seen: at(started),
        last_updated: at(started),
        frozen: true,
    }
}

fn build_123() -> Trace {
    let span = |name: &str, start: i64, end: i64, deps: Vec<String>| Span {
        id: format!("build-123-{}", name),
        trace_id: "ci/build-123".to_string(),
        name: name.to_string(),
        status: RunStatus::Succeeded,
        start_time: at(start),
        end_time: Some(at(end)),
        duration_ms: (end - start) * 1000,
        depends_on: deps,
    };

    Trace {
        id: "ci/build-123".to_string(),
        uid: "uid-build-123".to_string(),
        pipeline: "build".to_string(),
        namespace: "ci".to_string(),
        status: RunStatus::Succeeded,
        start_time: at(0),
        end_time: Some(at(20)),
        duration_ms: 20_000,
        dependency_source: DependencySource::Timing,
        spans: vec![
            span("clone", 0, 5, vec![]),
            span("test", 5, 20, vec!["build-123-clone".to_string()]),
        ],
    }
}

#[tokio::test]
async fn test_healthz_degraded_collector_still_ok() {
    let (app, _, health) = setup_test_app().await;
    health
        .record_failure(components::METRICS_COLLECTOR, "connection refused")
        .await;

    let (status, body) = get(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
}

#[tokio::test]
async fn test_readyz_before_and_after_start() {
    let (app, _, health) = setup_test_app().await;

    let (status, _) = get(&app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    health.set_ready(true).await;
    let (status, body) = get(&app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_prometheus_metrics_exposed() {
    let (app, _, _) = setup_test_app().await;
    ObserverMetrics::new().set_traces_tracked(1);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("pipeline_observer_traces_tracked"));
}

#[tokio::test]
async fn test_views_not_yet_available() {
    let (app, _, _) = setup_test_app().await;

    for uri in [
        "/api/v1/metrics",
        "/api/v1/costs",
        "/api/v1/costs/ci/build-1",
        "/api/v1/traces",
        "/api/v1/traces/ci/build-1",
        "/api/v1/insights",
        "/api/v1/controlplane",
    ] {
        let (status, body) = get(&app, uri).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{}", uri);
        assert_eq!(body["status"], "not_yet_available", "{}", uri);
    }

    let (status, body) = get(&app, "/api/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_cost_endpoints() {
    let (app, store, _) = setup_test_app().await;
    let records = vec![
        cost_record("ci", "build-1", 0.10, 0),
        cost_record("ci", "build-2", 0.30, 7200),
        cost_record("prod", "deploy-1", 1.00, 0),
    ];
    store.writer::<CostSnapshot>().unwrap().publish(CostSnapshot {
        computed_at: Some(at(8000)),
        records: records.into_iter().map(|r| (r.key.to_string(), r)).collect(),
    });

    let (status, body) = get(&app, "/api/v1/costs/ci/build-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_cost"], 0.10);
    assert!(body["published_at"].is_string());

    let (status, body) = get(&app, "/api/v1/costs?namespace=ci").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["summary"]["run_count"], 2);
    assert_eq!(body["data"]["runs"].as_array().unwrap().len(), 2);

    let (_, body) = get(&app, "/api/v1/costs?from=2024-05-01T11:00:00Z").await;
    assert_eq!(body["data"]["summary"]["run_count"], 1);
    assert_eq!(body["data"]["summary"]["total_cost"], 0.30);

    let (status, body) = get(&app, "/api/v1/costs/ci/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["id"], "ci/missing");
}

#[tokio::test]
async fn test_trace_endpoints() {
    let (app, store, _) = setup_test_app().await;
    store.writer::<TraceSnapshot>().unwrap().publish(TraceSnapshot {
        built_at: Some(at(30)),
        traces: vec![build_123()],
    });

    let (status, body) = get(&app, "/api/v1/traces").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = get(&app, "/api/v1/traces/ci/build-123").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "succeeded");
    assert_eq!(body["data"]["duration_ms"], 20_000);
    assert_eq!(body["data"]["spans"][1]["depends_on"][0], "build-123-clone");

    let (status, _) = get(&app, "/api/v1/traces/ci/build-999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_insight_filters() {
    let (app, store, _) = setup_test_app().await;
    let insight = |category, severity, source: &str| Insight {
        category,
        severity,
        message: format!("about {}", source),
        sources: vec![source.to_string()],
        generated_at: Some(at(60)),
    };
    store.writer::<InsightSnapshot>().unwrap().publish(InsightSnapshot {
        generated_at: Some(at(60)),
        insights: vec![
            insight(InsightCategory::CostAnomaly, Severity::Critical, "ci/a"),
            insight(InsightCategory::ResourceWaste, Severity::Warning, "ci/b"),
            insight(InsightCategory::Recommendation, Severity::Info, "ci/build"),
        ],
    });

    let (_, body) = get(&app, "/api/v1/insights").await;
    assert_eq!(body["data"]["insights"].as_array().unwrap().len(), 3);

    let (_, body) = get(&app, "/api/v1/insights?severity=warning").await;
    assert_eq!(body["data"]["insights"].as_array().unwrap().len(), 2);

    let (_, body) = get(&app, "/api/v1/insights?category=resource_waste").await;
    let insights = body["data"]["insights"].as_array().unwrap();
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0]["sources"][0], "ci/b");

    let (status, _) = get(&app, "/api/v1/insights?severity=loud").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_control_plane_endpoint() {
    let (app, store, _) = setup_test_app().await;
    store
        .writer::<ControlPlaneSnapshot>()
        .unwrap()
        .publish(ControlPlaneSnapshot {
            components: vec![ControlPlaneStatus {
                component: "tekton-pipelines-controller".to_string(),
                state: ReadinessState::Degraded,
                desired_replicas: 2,
                ready_replicas: 1,
                last_checked: at(0),
                error: Some("BackOff: restarting failed container".to_string()),
            }],
        });

    let (status, body) = get(&app, "/api/v1/controlplane").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["state"], "degraded");
    assert_eq!(body["data"][0]["ready_replicas"], 1);
}
