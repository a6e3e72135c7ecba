//! Observability infrastructure for the monitoring mesh
//!
//! Provides:
//! - Prometheus metrics (poll latency, training latency, ingestion counters,
//!   agent liveness gauges)
//! - Structured JSON logging with tracing

use crate::models::{AgentStatus, CriticalAlert, EntityId, Prediction};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Buckets for hypervisor poll latency (in seconds)
const POLL_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Buckets for model training latency (in seconds)
const TRAINING_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<SentinelMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct SentinelMetricsInner {
    poll_latency_seconds: Histogram,
    training_latency_seconds: Histogram,
    samples_ingested: IntCounter,
    samples_rejected: IntCounter,
    predictions_written: IntCounter,
    anomalies_flagged: IntCounter,
    critical_alerts: IntCounter,
    training_skipped: IntCounterVec,
    agents_by_status: IntGaugeVec,
    entities_known: IntGauge,
    poll_errors: IntCounter,
}

impl SentinelMetricsInner {
    fn new() -> Self {
        Self {
            poll_latency_seconds: register_histogram!(
                "sentinel_poll_latency_seconds",
                "Time spent polling the hypervisor API for one tick",
                POLL_BUCKETS.to_vec()
            )
            .expect("Failed to register poll_latency_seconds"),

            training_latency_seconds: register_histogram!(
                "sentinel_training_latency_seconds",
                "Time spent fitting and forecasting one entity",
                TRAINING_BUCKETS.to_vec()
            )
            .expect("Failed to register training_latency_seconds"),

            samples_ingested: register_int_counter!(
                "sentinel_samples_ingested_total",
                "Samples accepted by the aggregator"
            )
            .expect("Failed to register samples_ingested"),

            samples_rejected: register_int_counter!(
                "sentinel_samples_rejected_total",
                "Malformed samples dropped by the aggregator"
            )
            .expect("Failed to register samples_rejected"),

            predictions_written: register_int_counter!(
                "sentinel_predictions_written_total",
                "Predictions written to the store"
            )
            .expect("Failed to register predictions_written"),

            anomalies_flagged: register_int_counter!(
                "sentinel_anomalies_flagged_total",
                "Predictions flagged as anomalous"
            )
            .expect("Failed to register anomalies_flagged"),

            critical_alerts: register_int_counter!(
                "sentinel_critical_alerts_total",
                "Critical alerts emitted for the watchdog"
            )
            .expect("Failed to register critical_alerts"),

            training_skipped: register_int_counter_vec!(
                "sentinel_training_skipped_total",
                "Training jobs skipped or failed, by reason",
                &["reason"]
            )
            .expect("Failed to register training_skipped"),

            agents_by_status: register_int_gauge_vec!(
                "sentinel_agents",
                "Monitor agents by liveness status",
                &["status"]
            )
            .expect("Failed to register agents_by_status"),

            entities_known: register_int_gauge!(
                "sentinel_entities_known",
                "Entities registered with the aggregator"
            )
            .expect("Failed to register entities_known"),

            poll_errors: register_int_counter!(
                "sentinel_poll_errors_total",
                "Hypervisor calls that failed or timed out"
            )
            .expect("Failed to register poll_errors"),
        }
    }
}

/// Metrics handle for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct SentinelMetrics {
    _private: (),
}

impl Default for SentinelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SentinelMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SentinelMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SentinelMetricsInner {
        GLOBAL_METRICS.get_or_init(SentinelMetricsInner::new)
    }

    pub fn observe_poll_latency(&self, duration_secs: f64) {
        self.inner().poll_latency_seconds.observe(duration_secs);
    }

    pub fn observe_training_latency(&self, duration_secs: f64) {
        self.inner().training_latency_seconds.observe(duration_secs);
    }

    pub fn inc_samples_ingested(&self) {
        self.inner().samples_ingested.inc();
    }

    pub fn inc_samples_rejected(&self) {
        self.inner().samples_rejected.inc();
    }

    pub fn add_predictions_written(&self, count: u64) {
        self.inner().predictions_written.inc_by(count);
    }

    pub fn add_anomalies_flagged(&self, count: u64) {
        self.inner().anomalies_flagged.inc_by(count);
    }

    pub fn inc_critical_alerts(&self) {
        self.inner().critical_alerts.inc();
    }

    /// Count a skipped or failed training job under `reason`
    pub fn inc_training_skipped(&self, reason: &str) {
        self.inner()
            .training_skipped
            .with_label_values(&[reason])
            .inc();
    }

    /// Replace the per-status agent counts
    pub fn set_agents_by_status(&self, online: i64, stale: i64, offline: i64) {
        let gauge = &self.inner().agents_by_status;
        gauge.with_label_values(&[AgentStatus::Online.as_str()]).set(online);
        gauge.with_label_values(&[AgentStatus::Stale.as_str()]).set(stale);
        gauge.with_label_values(&[AgentStatus::Offline.as_str()]).set(offline);
    }

    pub fn set_entities_known(&self, count: i64) {
        self.inner().entities_known.set(count);
    }

    pub fn inc_poll_errors(&self) {
        self.inner().poll_errors.inc();
    }
}

/// Structured logger for mesh events
///
/// Every event carries a stable `event` field so log pipelines can key on
/// it regardless of message wording.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log an accepted sample
    pub fn log_sample_ingested(&self, from: &str, entity_id: &EntityId, timestamp: i64) {
        tracing::debug!(
            event = "sample_ingested",
            node = %self.node_name,
            from = %from,
            entity_id = %entity_id,
            timestamp = timestamp,
            "Sample stored"
        );
    }

    /// Log the outcome of one entity's forecast
    pub fn log_predictions(&self, entity_id: &EntityId, predictions: &[Prediction]) {
        let anomalies = predictions.iter().filter(|p| p.is_anomaly).count();
        let peak_cpu = predictions
            .iter()
            .map(|p| p.predicted_cpu)
            .fold(0.0_f64, f64::max);
        info!(
            event = "prediction_generated",
            node = %self.node_name,
            entity_id = %entity_id,
            horizon = predictions.len(),
            anomalies = anomalies,
            peak_cpu = peak_cpu,
            "Generated forecast"
        );
    }

    /// Log a critical alert handed to the watchdog
    pub fn log_critical_alert(&self, alert: &CriticalAlert) {
        warn!(
            event = "critical_alert",
            node = %self.node_name,
            entity_id = %alert.entity_id,
            cycle = alert.cycle,
            reason = %alert.reason,
            "Critical entity forecast to breach threshold"
        );
    }

    /// Log an agent liveness transition
    pub fn log_agent_status(&self, agent_id: &str, from: AgentStatus, to: AgentStatus) {
        match to {
            AgentStatus::Online => info!(
                event = "agent_status_changed",
                node = %self.node_name,
                agent_id = %agent_id,
                from = %from,
                to = %to,
                "Agent back online"
            ),
            _ => warn!(
                event = "agent_status_changed",
                node = %self.node_name,
                agent_id = %agent_id,
                from = %from,
                to = %to,
                "Agent liveness degraded"
            ),
        }
    }

    /// Log a training job that produced no predictions
    pub fn log_training_skipped(&self, entity_id: &EntityId, reason: &str, details: &str) {
        info!(
            event = "training_skipped",
            node = %self.node_name,
            entity_id = %entity_id,
            reason = %reason,
            details = %details,
            "Training skipped for this cycle"
        );
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, role: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            role = %role,
            "Sentinel agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Sentinel agent shutting down"
        );
    }
}
