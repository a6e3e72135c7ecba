//! Integration tests for the agent API endpoints

#[path = "../src/api.rs"]
#[allow(dead_code)]
mod api;

use api::{create_router, AppState};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use sentinel_lib::{
    aggregator::{Aggregator, AggregatorConfig},
    health::{components, HealthRegistry},
    observability::SentinelMetrics,
    store::InMemoryStore,
    EntityId, Heartbeat, MetricSample, SampleReport,
};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::TRANSPORT).await;
    health_registry.register(components::COLLECTOR).await;

    let state = Arc::new(AppState::new(health_registry, SentinelMetrics::new()));
    (create_router(state.clone()), state)
}

async fn setup_cerebro_app() -> (Router, Arc<Aggregator>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::AGGREGATOR).await;

    let store = Arc::new(InMemoryStore::new());
    let aggregator = Arc::new(Aggregator::new(AggregatorConfig::default(), store));
    let state = Arc::new(
        AppState::new(health_registry, SentinelMetrics::new()).with_aggregator(aggregator.clone()),
    );
    (create_router(state), aggregator)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let health = json_body(response).await;
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["transport"].is_object());
    assert!(health["components"]["collector"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::COLLECTOR, "guest 101 status timed out")
        .await;

    let response = app.oneshot(get("/healthz")).await.unwrap();

    // Degraded still returns 200 (operational)
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::TRANSPORT, "credentials rejected")
        .await;

    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_readiness_and_health() {
    let (app, state) = setup_test_app().await;

    // Not ready until startup finishes
    let response = app.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["ready"], false);

    state.health_registry.set_ready(true).await;
    let response = app.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    state
        .health_registry
        .set_unhealthy(components::TRANSPORT, "credentials rejected")
        .await;
    let response = app.oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let readiness = json_body(response).await;
    assert!(readiness["reason"].as_str().unwrap().contains("transport"));
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_poll_latency(0.02);
    state.metrics.observe_training_latency(1.5);
    state.metrics.inc_training_skipped("insufficient_data");

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("sentinel_poll_latency_seconds_bucket"));
    assert!(metrics_text.contains("sentinel_training_latency_seconds_count"));
    assert!(metrics_text.contains("sentinel_training_skipped_total"));
    assert!(metrics_text.contains("sentinel_samples_ingested_total"));
}

#[tokio::test]
async fn test_dashboard_routes_absent_on_monitor() {
    let (app, _state) = setup_test_app().await;

    let response = app.clone().oneshot(get("/entities")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.oneshot(get("/agents")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_set_critical_creates_entity() {
    let (app, _aggregator) = setup_cerebro_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/entities/pve1%2F101/critical")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"critical": true}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let entity = json_body(response).await;
    assert_eq!(entity["id"], "pve1/101");
    assert_eq!(entity["critical"], true);
    assert_eq!(entity["kind"], "virtual_machine");

    let response = app.clone().oneshot(get("/entities")).await.unwrap();
    let entities = json_body(response).await;
    assert_eq!(entities.as_array().unwrap().len(), 1);
    assert_eq!(entities[0]["critical"], true);

    // Known entity without a forecast yet
    let response = app.oneshot(get("/predictions/pve1%2F101")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, serde_json::json!([]));
}

#[tokio::test]
async fn test_predictions_for_unknown_entity_is_404() {
    let (app, _aggregator) = setup_cerebro_app().await;

    let response = app.oneshot(get("/predictions/nowhere")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_agents_lists_registrations() {
    let (app, aggregator) = setup_cerebro_app().await;

    aggregator.on_heartbeat(
        "monitor-pve1",
        Heartbeat {
            agent_id: "monitor-pve1".to_string(),
            node: "pve1".to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            hypervisor_ok: true,
            entity_ids: vec![EntityId::host("pve1")],
        },
    );

    let response = app.oneshot(get("/agents")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let agents = json_body(response).await;
    assert_eq!(agents[0]["agent_id"], "monitor-pve1");
    assert_eq!(agents[0]["status"], "online");
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn guest_report(vmid: u32, ts: i64, status: &str) -> SampleReport {
    SampleReport {
        sample: MetricSample {
            entity_id: EntityId::guest("pve1", vmid),
            timestamp: ts,
            cpu_pct: 25.0,
            mem_pct: 40.0,
            disk_used: 0,
            net_in: 0,
            net_out: 0,
            status: status.to_string(),
        },
        node: "pve1".to_string(),
        vmid: Some(vmid),
        display_name: format!("vm-{}", vmid),
    }
}

#[tokio::test]
async fn test_forecast_trigger_filters_by_kind() {
    let (app, aggregator) = setup_cerebro_app().await;
    let t0 = chrono::Utc::now().timestamp() - 20 * 3600;
    for i in 0..20 {
        let ts = t0 + i * 3600;
        aggregator
            .on_sample("monitor-pve1", guest_report(101, ts, "running"))
            .await
            .unwrap();
        aggregator
            .on_sample("monitor-pve1", guest_report(102, ts, "stopped"))
            .await
            .unwrap();
    }

    let response = app.clone().oneshot(post("/forecasts?kind=vm")).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let report = json_body(response).await;
    assert_eq!(report["cycle"], 1);
    assert_eq!(report["scheduled"], 1);
    assert_eq!(report["skipped_not_running"], 1);

    // No hosts known yet
    let response = app.clone().oneshot(post("/forecasts?kind=host")).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let report = json_body(response).await;
    assert_eq!(report["scheduled"], 0);
    assert_eq!(report["skipped_not_running"], 0);

    let response = app.oneshot(post("/forecasts?kind=container")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_forecast_trigger_absent_on_monitor() {
    let (app, _state) = setup_test_app().await;

    let response = app.oneshot(post("/forecasts")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
