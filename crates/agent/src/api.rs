//! HTTP API for health checks, Prometheus metrics and the dashboard
//!
//! Both roles serve `/healthz`, `/readyz` and `/metrics`. The cerebro role
//! adds read access to entities, agents and predictions, the critical flag
//! toggle and an on-demand forecast trigger. Guest ids contain a `/` and
//! must be percent-encoded in paths (`pve1%2F101`).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use sentinel_lib::{
    aggregator::Aggregator,
    health::{ComponentStatus, HealthRegistry},
    observability::SentinelMetrics,
    EntityId, EntityKind,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: SentinelMetrics,
    /// Present in the cerebro role only
    pub aggregator: Option<Arc<Aggregator>>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: SentinelMetrics) -> Self {
        Self {
            health_registry,
            metrics,
            aggregator: None,
        }
    }

    pub fn with_aggregator(mut self, aggregator: Arc<Aggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }
}

/// Body of `PUT /entities/:entity_id/critical`
#[derive(Debug, Deserialize)]
pub struct CriticalToggle {
    pub critical: bool,
}

/// Query of `POST /forecasts`
#[derive(Debug, Deserialize)]
pub struct ForecastTrigger {
    /// `host` or `vm`; every kind when absent
    pub kind: Option<String>,
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
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

fn not_cerebro() -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not served by this role" })),
    )
        .into_response()
}

/// Known entities with their critical flags
async fn list_entities(State(state): State<Arc<AppState>>) -> axum::response::Response {
    match &state.aggregator {
        Some(aggregator) => Json(aggregator.entities()).into_response(),
        None => not_cerebro(),
    }
}

/// Agent registrations with liveness status
async fn list_agents(State(state): State<Arc<AppState>>) -> axum::response::Response {
    match &state.aggregator {
        Some(aggregator) => Json(aggregator.agents()).into_response(),
        None => not_cerebro(),
    }
}

/// Current predictions for one entity
async fn entity_predictions(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> axum::response::Response {
    let Some(aggregator) = &state.aggregator else {
        return not_cerebro();
    };
    let entity_id = EntityId::new(entity_id);

    match aggregator.predictions_for(&entity_id).await {
        Ok(predictions) if predictions.is_empty() && aggregator.entity(&entity_id).is_none() => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown entity {}", entity_id) })),
        )
            .into_response(),
        Ok(predictions) => Json(predictions).into_response(),
        Err(e) => {
            error!(entity_id = %entity_id, error = %e, "Failed to read predictions");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Toggle the critical flag, creating the entity if needed
async fn set_critical(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
    Json(body): Json<CriticalToggle>,
) -> axum::response::Response {
    match &state.aggregator {
        Some(aggregator) => {
            Json(aggregator.set_critical(&EntityId::new(entity_id), body.critical)).into_response()
        }
        None => not_cerebro(),
    }
}

/// Start a forecast cycle now, optionally for one entity kind
async fn trigger_forecasts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ForecastTrigger>,
) -> axum::response::Response {
    let Some(aggregator) = &state.aggregator else {
        return not_cerebro();
    };

    let kind = match query.kind.as_deref() {
        None => None,
        Some(raw) => match EntityKind::parse(raw) {
            Some(kind) => Some(kind),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("unknown kind {}", raw) })),
                )
                    .into_response()
            }
        },
    };

    let report = aggregator
        .trigger_forecasts_for(chrono::Utc::now().timestamp(), kind)
        .await;
    info!(cycle = report.cycle, scheduled = report.scheduled, "Forecast cycle requested");
    (StatusCode::ACCEPTED, Json(report)).into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/entities", get(list_entities))
        .route("/entities/:entity_id/critical", put(set_critical))
        .route("/agents", get(list_agents))
        .route("/predictions/:entity_id", get(entity_predictions))
        .route("/forecasts", post(trigger_forecasts))
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
