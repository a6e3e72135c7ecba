//! Component health for the `/healthz` and `/readyz` endpoints
//!
//! Every long-running part of an agent (transport link, hypervisor polling,
//! aggregation, forecasting, store) reports its own status here. The overall
//! status is the worst component status; readiness additionally requires
//! startup to have completed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still serving, but something needs attention
    Degraded,
    Unhealthy,
}

/// Last reported health of one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix seconds of the last report
    pub since: i64,
}

impl ComponentHealth {
    fn report(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            since: chrono::Utc::now().timestamp(),
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const TRANSPORT: &str = "transport";
    pub const COLLECTOR: &str = "collector";
    pub const AGGREGATOR: &str = "aggregator";
    pub const FORECASTER: &str = "forecaster";
    pub const STORE: &str = "store";
}

#[derive(Debug, Default)]
struct HealthState {
    components: BTreeMap<String, ComponentHealth>,
    ready: bool,
}

impl HealthState {
    fn overall(&self) -> ComponentStatus {
        self.components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

/// Shared, cloneable view of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a component as healthy
    pub async fn register(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    async fn set(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), ComponentHealth::report(status, message));
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    /// Current status of a single component
    pub async fn status_of(&self, name: &str) -> Option<ComponentStatus> {
        self.state
            .read()
            .await
            .components
            .get(name)
            .map(|h| h.status)
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        HealthResponse {
            status: state.overall(),
            components: state.components.clone(),
        }
    }

    /// Ready once startup finished and no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;

        if !state.ready {
            return ReadinessResponse {
                ready: false,
                reason: Some("startup not complete".to_string()),
            };
        }

        let failing: Vec<&str> = state
            .components
            .iter()
            .filter(|(_, h)| h.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect();

        if failing.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("unhealthy: {}", failing.join(", "))),
            }
        }
    }
}
