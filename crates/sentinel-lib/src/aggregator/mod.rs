//! Central aggregator ("cerebro")
//!
//! This module provides:
//! - Sample ingestion with validation, entity auto-registration and a
//!   single serialized store writer
//! - Agent liveness tracking from heartbeats, samples and presence
//! - The periodic forecast trigger feeding the training pool
//! - Critical alerts for entities flagged critical

mod liveness;
mod registry;
mod writer;

#[cfg(test)]
mod tests;

pub use liveness::{AgentRegistry, LivenessConfig, StatusChange};
pub use registry::EntityRegistry;
pub use writer::StoreWriter;

use crate::anomaly::{AnomalyPolicy, CriticalAlerter};
use crate::error::{Result, SentinelError};
use crate::forecast::{
    CycleReport, ForecastConfig, ForecastEngine, JobOutcome, SchedulerConfig, TrainingScheduler,
};
use crate::health::{components, HealthRegistry};
use crate::models::{
    AgentRegistration, CriticalAlert, Entity, EntityId, EntityKind, Heartbeat, Prediction,
    SampleReport,
};
use crate::observability::{SentinelMetrics, StructuredLogger};
use crate::proto::{Envelope, Payload};
use crate::store::MetricsStore;
use crate::transport::{MessageHandler, PresenceEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Configuration for the aggregator
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Transport identity (default: `cerebro`)
    pub identity: String,
    /// Period of the forecast trigger (default: 1 hour)
    pub forecast_interval: Duration,
    /// Period of the liveness sweep (default: 15 seconds)
    pub sweep_interval: Duration,
    pub liveness: LivenessConfig,
    pub forecast: ForecastConfig,
    pub scheduler: SchedulerConfig,
    pub policy: AnomalyPolicy,
    /// Extra cycles an alerted entity stays silent (default: 0)
    pub alert_suppression_cycles: u64,
    /// Queue depth of the store writer
    pub write_buffer: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            identity: "cerebro".to_string(),
            forecast_interval: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(15),
            liveness: LivenessConfig::default(),
            forecast: ForecastConfig::default(),
            scheduler: SchedulerConfig::default(),
            policy: AnomalyPolicy::default(),
            alert_suppression_cycles: 0,
            write_buffer: 1024,
        }
    }
}

impl AggregatorConfig {
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_forecast_interval(mut self, interval: Duration) -> Self {
        self.forecast_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_liveness(mut self, liveness: LivenessConfig) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_forecast(mut self, forecast: ForecastConfig) -> Self {
        self.forecast = forecast;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_policy(mut self, policy: AnomalyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_alert_suppression(mut self, cycles: u64) -> Self {
        self.alert_suppression_cycles = cycles;
        self
    }
}

/// Capacity of the alert broadcast
const ALERT_BUFFER: usize = 256;

/// Receives every agent's traffic, owns sample writes and drives forecasting
pub struct Aggregator {
    config: AggregatorConfig,
    store: Arc<dyn MetricsStore>,
    writer: StoreWriter,
    entities: EntityRegistry,
    agents: AgentRegistry,
    engine: Arc<ForecastEngine>,
    scheduler: TrainingScheduler,
    outcomes: Mutex<Option<mpsc::Receiver<JobOutcome>>>,
    alerter: CriticalAlerter,
    alerts: broadcast::Sender<CriticalAlert>,
    cycle: AtomicU64,
    store_failing: AtomicBool,
    health: Option<HealthRegistry>,
    metrics: SentinelMetrics,
    logger: StructuredLogger,
}

impl Aggregator {
    /// Build the aggregator over `store`.
    ///
    /// Must be called inside a tokio runtime; the store writer task starts
    /// immediately.
    pub fn new(config: AggregatorConfig, store: Arc<dyn MetricsStore>) -> Self {
        let (writer, _task) = StoreWriter::spawn(store.clone(), config.write_buffer);
        let engine = Arc::new(ForecastEngine::new(
            store.clone(),
            config.forecast.clone(),
            config.policy,
        ));
        let (scheduler, outcomes) = TrainingScheduler::new(engine.clone(), config.scheduler.clone());
        let alerter = CriticalAlerter::new(config.policy)
            .with_suppression_cycles(config.alert_suppression_cycles);
        let (alerts, _) = broadcast::channel(ALERT_BUFFER);

        Self {
            logger: StructuredLogger::new(config.identity.clone()),
            agents: AgentRegistry::new(config.liveness),
            config,
            store,
            writer,
            entities: EntityRegistry::new(),
            engine,
            scheduler,
            outcomes: Mutex::new(Some(outcomes)),
            alerter,
            alerts,
            cycle: AtomicU64::new(0),
            store_failing: AtomicBool::new(false),
            health: None,
            metrics: SentinelMetrics::new(),
        }
    }

    /// Report aggregator, forecaster and store health into `health`
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn engine(&self) -> &ForecastEngine {
        &self.engine
    }

    /// Run the forecast trigger, liveness sweep and outcome handling until
    /// `shutdown` fires
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let Some(mut outcomes) = self.outcomes.lock().ok().and_then(|mut o| o.take()) else {
            warn!("Aggregator loop already running");
            return;
        };

        if let Some(health) = &self.health {
            for name in [components::AGGREGATOR, components::FORECASTER, components::STORE] {
                health.register(name).await;
            }
        }

        info!(
            identity = %self.config.identity,
            forecast_interval_secs = self.config.forecast_interval.as_secs(),
            pool_size = self.config.scheduler.pool_size,
            "Starting aggregator"
        );

        let mut forecast_ticker = interval_at(
            Instant::now() + self.config.forecast_interval,
            self.config.forecast_interval,
        );
        forecast_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep_ticker = interval(self.config.sweep_interval);
        sweep_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,
                Some(outcome) = outcomes.recv() => {
                    self.handle_outcome(outcome, unix_now()).await;
                }
                _ = forecast_ticker.tick() => {
                    self.trigger_forecasts(unix_now()).await;
                }
                _ = sweep_ticker.tick() => {
                    self.sweep(unix_now());
                }
            }
        }

        info!(
            in_flight = self.scheduler.in_flight_count(),
            "Aggregator stopped"
        );
    }

    /// Validate and store one sample, registering its entity on first
    /// sight
    pub async fn on_sample(&self, from: &str, report: SampleReport) -> Result<()> {
        if let Err(e) = report.sample.validate() {
            self.metrics.inc_samples_rejected();
            warn!(from = %from, error = %e, "Dropping invalid sample");
            return Err(e);
        }

        if let Some(entity) = self.entities.observe(&report) {
            info!(
                entity_id = %entity.id,
                kind = entity.kind.as_str(),
                from = %from,
                "Registered new entity"
            );
            self.metrics.set_entities_known(self.entities.len() as i64);
        }

        self.entities.record_status(&report.sample);
        let entity_id = report.sample.entity_id.clone();
        let timestamp = report.sample.timestamp;
        if let Err(e) = self.writer.upsert_sample(report.sample).await {
            error!(entity_id = %entity_id, error = %e, "Failed to store sample");
            if !self.store_failing.swap(true, Ordering::SeqCst) {
                self.set_unhealthy(components::STORE, e.to_string()).await;
            }
            return Err(e);
        }
        if self.store_failing.swap(false, Ordering::SeqCst) {
            if let Some(health) = &self.health {
                health.set_healthy(components::STORE).await;
            }
        }

        self.metrics.inc_samples_ingested();
        self.logger.log_sample_ingested(from, &entity_id, timestamp);
        if let Some(change) = self.agents.on_sample(from, &entity_id, unix_now()) {
            self.record_change(&change);
        }
        Ok(())
    }

    /// Refresh the sender's registration
    pub fn on_heartbeat(&self, from: &str, heartbeat: Heartbeat) {
        if heartbeat.agent_id != from {
            debug!(
                from = %from,
                claimed = %heartbeat.agent_id,
                "Heartbeat agent_id differs from sender, using sender"
            );
        }
        if !heartbeat.hypervisor_ok {
            warn!(
                agent_id = %from,
                node = %heartbeat.node,
                "Agent alive but its hypervisor API is failing"
            );
        }

        if let Some(change) = self.agents.on_heartbeat(from, &heartbeat, unix_now()) {
            self.record_change(&change);
        }
        self.update_agent_gauges();
    }

    /// React to the broker reporting a peer up or down
    pub fn on_peer_presence(&self, event: PresenceEvent) {
        match event {
            PresenceEvent::PeerOnline(peer) => debug!(peer = %peer, "Peer online"),
            PresenceEvent::PeerOffline(peer) => {
                if let Some(change) = self.agents.on_link_down(&peer) {
                    self.record_change(&change);
                    self.update_agent_gauges();
                }
            }
        }
    }

    /// Apply liveness timeouts at `now`
    pub fn sweep(&self, now: i64) -> Vec<StatusChange> {
        let changes = self.agents.sweep(now);
        for change in &changes {
            self.record_change(change);
        }
        self.update_agent_gauges();
        changes
    }

    /// Start a forecast cycle for every entity with enough history.
    pub async fn trigger_forecasts(&self, now: i64) -> CycleReport {
        self.trigger_forecasts_for(now, None).await
    }

    /// Start a forecast cycle, optionally only for entities of `kind`.
    ///
    /// Entities that are stopped or offline, lack history, or still have a
    /// job running are skipped.
    pub async fn trigger_forecasts_for(&self, now: i64, kind: Option<EntityKind>) -> CycleReport {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;

        let mut eligible = Vec::new();
        let mut skipped_insufficient_data = 0;
        let mut skipped_not_running = 0;
        for entity in self.entities.list() {
            if kind.is_some_and(|k| k != entity.kind) {
                continue;
            }
            if self.entities.is_running(&entity.id) == Some(false) {
                debug!(entity_id = %entity.id, "Entity not running, skipping forecast");
                skipped_not_running += 1;
                self.metrics.inc_training_skipped("not_running");
                continue;
            }

            let required = self.engine.config().min_points_for(entity.kind);
            match self.store.sample_count(&entity.id).await {
                Ok(count) if count >= required => eligible.push(entity),
                Ok(count) => {
                    debug!(
                        entity_id = %entity.id,
                        count = count,
                        required = required,
                        "Not enough history to forecast"
                    );
                    skipped_insufficient_data += 1;
                    self.metrics.inc_training_skipped("insufficient_data");
                }
                Err(e) => warn!(entity_id = %entity.id, error = %e, "Failed to count samples"),
            }
        }

        let report = CycleReport {
            skipped_insufficient_data,
            skipped_not_running,
            ..self.scheduler.trigger(eligible, cycle, now)
        };
        info!(
            cycle = cycle,
            kind = kind.map(|k| k.as_str()).unwrap_or("all"),
            scheduled = report.scheduled,
            skipped_in_flight = report.skipped_in_flight,
            skipped_insufficient_data = report.skipped_insufficient_data,
            skipped_not_running = report.skipped_not_running,
            "Forecast cycle triggered"
        );
        report
    }

    /// Log a finished job and raise a critical alert if it warrants one
    pub async fn handle_outcome(&self, outcome: JobOutcome, now: i64) -> Option<CriticalAlert> {
        let JobOutcome {
            entity,
            cycle,
            elapsed,
            result,
        } = outcome;

        let predictions = match result {
            Ok(predictions) => predictions,
            Err(e) => {
                if let SentinelError::Store(reason) = &e {
                    error!(entity_id = %entity.id, error = %reason, "Forecast could not reach the store");
                    if let Some(health) = &self.health {
                        health.set_degraded(components::FORECASTER, reason.clone()).await;
                    }
                }
                self.logger
                    .log_training_skipped(&entity.id, e.kind().as_str(), &e.to_string());
                return None;
            }
        };

        debug!(
            entity_id = %entity.id,
            cycle = cycle,
            elapsed_ms = elapsed.as_millis() as u64,
            "Training finished"
        );
        self.logger.log_predictions(&entity.id, &predictions);

        // The flag may have been toggled while the job ran
        let current = self.entities.get(&entity.id).unwrap_or(entity);
        let alert = self.alerter.evaluate(&current, &predictions, cycle, now)?;

        self.logger.log_critical_alert(&alert);
        self.metrics.inc_critical_alerts();
        if self.alerts.send(alert.clone()).is_err() {
            debug!(entity_id = %alert.entity_id, "No alert subscribers");
        }
        Some(alert)
    }

    /// Toggle the critical flag; unknown entities get a placeholder
    pub fn set_critical(&self, entity_id: &EntityId, critical: bool) -> Entity {
        let before = self.entities.len();
        let entity = self.entities.set_critical(entity_id, critical);
        if self.entities.len() != before {
            self.metrics.set_entities_known(self.entities.len() as i64);
        }
        if !critical {
            self.alerter.forget(entity_id);
        }
        info!(entity_id = %entity_id, critical = critical, "Critical flag set");
        entity
    }

    /// Stream of critical alerts for the watchdog
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<CriticalAlert> {
        self.alerts.subscribe()
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.entities.list()
    }

    pub fn entity(&self, entity_id: &EntityId) -> Option<Entity> {
        self.entities.get(entity_id)
    }

    pub fn agents(&self) -> Vec<AgentRegistration> {
        self.agents.list()
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.agents.get(agent_id)
    }

    pub async fn predictions_for(&self, entity_id: &EntityId) -> Result<Vec<Prediction>> {
        self.store.predictions_for(entity_id).await
    }

    /// Number of forecast cycles triggered so far
    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.scheduler.in_flight_count()
    }

    fn record_change(&self, change: &StatusChange) {
        self.logger
            .log_agent_status(&change.agent_id, change.from, change.to);
    }

    fn update_agent_gauges(&self) {
        let (online, stale, offline) = self.agents.counts();
        self.metrics.set_agents_by_status(online, stale, offline);
    }

    async fn set_unhealthy(&self, component: &str, message: String) {
        if let Some(health) = &self.health {
            health.set_unhealthy(component, message).await;
        }
    }
}

#[async_trait]
impl MessageHandler for Aggregator {
    async fn on_message(&self, from: &str, envelope: Envelope) {
        match Payload::try_from(envelope) {
            Ok(Payload::Sample(report)) => {
                // Failures are logged and counted inside
                let _ = self.on_sample(from, report).await;
            }
            Ok(Payload::Heartbeat(heartbeat)) => self.on_heartbeat(from, heartbeat),
            Ok(Payload::Command(command)) => {
                debug!(from = %from, command = %command.command, "Ignoring command")
            }
            Err(e) => {
                self.metrics.inc_samples_rejected();
                warn!(from = %from, error = %e, "Dropping malformed message");
            }
        }
    }

    async fn on_presence(&self, event: PresenceEvent) {
        self.on_peer_presence(event);
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
