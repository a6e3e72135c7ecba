//! Monitor agent poll loop
//!
//! Drives the connection state machine, polls the hypervisor once per tick
//! and publishes one sample per entity plus a heartbeat to the aggregator.

use super::state::{self, Effect, MonitorEvent, MonitorState};
use super::{ConnectionRegistry, Target};
use crate::error::{ErrorKind, Result, SentinelError};
use crate::health::{components, HealthRegistry};
use crate::models::{Heartbeat, SampleReport};
use crate::observability::SentinelMetrics;
use crate::proto::{Command, Payload};
use crate::transport::{
    Backoff, Credentials, Delivery, Inbound, LinkStatus, PresenceEvent, Session, Transport,
    DEFAULT_BASE_BACKOFF, DEFAULT_MAX_BACKOFF,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Configuration for a monitor agent
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Transport identity (default: `monitor-<node>`)
    pub agent_id: String,
    /// Hypervisor node this agent watches
    pub node: String,
    /// Transport identity of the aggregator
    pub aggregator_id: String,
    /// Poll interval (default: 30 seconds)
    pub poll_interval: Duration,
    /// Deadline for each hypervisor call (default: 10 seconds)
    pub call_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl MonitorConfig {
    pub fn new(node: impl Into<String>) -> Self {
        let node = node.into();
        Self {
            agent_id: format!("monitor-{}", node),
            node,
            aggregator_id: "cerebro".to_string(),
            poll_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            backoff_base: DEFAULT_BASE_BACKOFF,
            backoff_cap: DEFAULT_MAX_BACKOFF,
        }
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_aggregator_id(mut self, aggregator_id: impl Into<String>) -> Self {
        self.aggregator_id = aggregator_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }
}

/// Outcome of polling the hypervisor for one tick
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub timestamp: i64,
    pub samples: Vec<SampleReport>,
    /// Hypervisor calls that failed or timed out
    pub failures: usize,
    /// At least one hypervisor call succeeded
    pub hypervisor_ok: bool,
}

/// Per-host collector publishing samples and heartbeats
pub struct MonitorAgent {
    config: MonitorConfig,
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    registry: ConnectionRegistry,
    state: MonitorState,
    session: Option<Session>,
    /// Inbound stream of a session opened since the run loop last looked
    fresh_inbound: Option<mpsc::Receiver<Inbound>>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    last_report: Option<TickReport>,
    health: Option<HealthRegistry>,
    metrics: SentinelMetrics,
}

impl MonitorAgent {
    pub fn new(
        config: MonitorConfig,
        transport: Arc<dyn Transport>,
        credentials: Credentials,
        registry: ConnectionRegistry,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_base, config.backoff_cap);
        Self {
            config,
            transport,
            credentials,
            registry,
            state: MonitorState::default(),
            session: None,
            fresh_inbound: None,
            backoff,
            retry_at: None,
            last_report: None,
            health: None,
            metrics: SentinelMetrics::new(),
        }
    }

    /// Report transport and collector health into `health`
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run until `shutdown` fires
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            agent_id = %self.config.agent_id,
            node = %self.config.node,
            interval_secs = self.config.poll_interval.as_secs(),
            "Starting monitor agent"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbound: Option<mpsc::Receiver<Inbound>> = None;
        self.retry_at = Some(Instant::now());

        loop {
            if let Some(rx) = self.fresh_inbound.take() {
                inbound = Some(rx);
            }
            let retry_at = self.retry_at;

            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    self.handle(MonitorEvent::ShutdownRequested).await;
                    break;
                }
                _ = wait_until(retry_at) => {
                    self.retry_at = None;
                    self.handle(MonitorEvent::RetryElapsed).await;
                }
                _ = ticker.tick() => {
                    self.sync_link_state().await;
                    self.handle(MonitorEvent::Tick).await;
                }
                item = next_inbound(&mut inbound) => match item {
                    Some(item) => self.on_inbound(item).await,
                    None => {
                        debug!("Session inbound stream ended");
                        inbound = None;
                        self.sync_link_state().await;
                    }
                },
            }
        }

        info!(agent_id = %self.config.agent_id, "Monitor agent stopped");
    }

    /// Feed one event through the state machine and perform its effects
    pub async fn handle(&mut self, event: MonitorEvent) {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let (next, effects) = state::transition(self.state, event);
            if next != self.state {
                debug!(
                    from = self.state.as_str(),
                    to = next.as_str(),
                    event = ?event,
                    "Monitor state transition"
                );
                self.state = next;
            }

            for effect in effects {
                if let Some(follow_up) = self.perform(effect).await {
                    pending.push_back(follow_up);
                }
            }
        }
    }

    async fn perform(&mut self, effect: Effect) -> Option<MonitorEvent> {
        match effect {
            Effect::Connect => Some(self.connect().await),
            Effect::ScheduleRetry { attempt } => {
                let delay = self.backoff.next_delay();
                info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
                self.retry_at = Some(Instant::now() + delay);
                None
            }
            Effect::Poll => {
                let report = self.poll_once().await;
                self.publish_samples(&report).await;
                self.last_report = Some(report);
                None
            }
            Effect::PublishHeartbeat => {
                self.publish_heartbeat().await;
                None
            }
            Effect::ReportAuthFailure => {
                error!(
                    agent_id = %self.config.agent_id,
                    "Transport rejected credentials, not retrying"
                );
                self.set_health(|h| async move {
                    h.set_unhealthy(components::TRANSPORT, "credentials rejected")
                        .await
                })
                .await;
                None
            }
            Effect::Close => {
                self.fresh_inbound = None;
                if let Some(session) = self.session.take() {
                    session.close().await;
                }
                None
            }
        }
    }

    async fn connect(&mut self) -> MonitorEvent {
        match self
            .transport
            .connect(&self.config.agent_id, &self.credentials)
            .await
        {
            Ok(session) => {
                info!(agent_id = %self.config.agent_id, "Connected to transport");
                self.fresh_inbound = session.take_inbound();
                self.session = Some(session);
                self.backoff.reset();
                self.set_health(|h| async move { h.set_healthy(components::TRANSPORT).await })
                    .await;
                MonitorEvent::ConnectSucceeded
            }
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Transport connect failed");
                let message = e.to_string();
                self.set_health(|h| async move {
                    h.set_degraded(components::TRANSPORT, message).await
                })
                .await;
                MonitorEvent::ConnectFailed(e.kind())
            }
        }
    }

    /// Translate the session's link status into state machine events
    pub(crate) async fn sync_link_state(&mut self) {
        let Some(status) = self.session.as_ref().map(|s| s.status()) else {
            return;
        };
        match (self.state, status) {
            (MonitorState::Connected, LinkStatus::Reconnecting) => {
                warn!("Transport link lost, samples dropped until it returns");
                self.set_health(|h| async move {
                    h.set_degraded(components::TRANSPORT, "reconnecting").await
                })
                .await;
                self.handle(MonitorEvent::LinkDown).await;
            }
            (MonitorState::Reconnecting, LinkStatus::Up) => {
                info!("Transport link restored");
                self.set_health(|h| async move { h.set_healthy(components::TRANSPORT).await })
                    .await;
                self.handle(MonitorEvent::LinkUp).await;
            }
            (MonitorState::Connected | MonitorState::Reconnecting, LinkStatus::Closed) => {
                warn!(agent_id = %self.config.agent_id, "Transport session lost, reconnecting");
                self.set_health(|h| async move {
                    h.set_degraded(components::TRANSPORT, "session lost").await
                })
                .await;
                self.handle(MonitorEvent::SessionEnded).await;
            }
            (MonitorState::Connected | MonitorState::Reconnecting, LinkStatus::AuthRejected) => {
                self.handle(MonitorEvent::ConnectFailed(ErrorKind::Auth))
                    .await;
            }
            _ => {}
        }
    }

    async fn on_inbound(&mut self, item: Inbound) {
        match item {
            Inbound::Message { from, envelope } => match Payload::try_from(envelope) {
                Ok(Payload::Command(cmd)) if cmd.command == Command::POLL_NOW => {
                    info!(from = %from, "Poll requested");
                    self.handle(MonitorEvent::Tick).await;
                }
                Ok(other) => debug!(from = %from, kind = ?other.kind(), "Ignoring message"),
                Err(e) => warn!(from = %from, error = %e, "Dropping malformed message"),
            },
            Inbound::Presence(PresenceEvent::PeerOffline(peer))
                if peer == self.config.aggregator_id =>
            {
                warn!(aggregator = %peer, "Aggregator offline, broker will queue samples");
            }
            Inbound::Presence(event) => debug!(event = ?event, "Presence"),
        }
    }

    /// Poll the host and every guest on it, isolating each call
    pub async fn poll_once(&self) -> TickReport {
        let started = Instant::now();
        let node = self.config.node.clone();
        let mut report = TickReport {
            timestamp: chrono::Utc::now().timestamp(),
            ..Default::default()
        };

        let Some(api) = self.registry.get(&node) else {
            warn!(node = %node, "No hypervisor client registered for node");
            report.failures = 1;
            self.metrics.inc_poll_errors();
            self.record_collector_health(&report).await;
            return report;
        };

        let mut targets = vec![Target::Host { node: node.clone() }];
        match self.call(api.list_guests(&node)).await {
            Ok(guests) => {
                report.hypervisor_ok = true;
                targets.extend(guests.into_iter().map(|guest| Target::Guest {
                    node: node.clone(),
                    guest,
                }));
            }
            Err(e) => {
                report.failures += 1;
                self.metrics.inc_poll_errors();
                warn!(node = %node, error = %e, "Failed to list guests");
            }
        }

        for target in &targets {
            match self.call(target.poll(api.as_ref())).await {
                Ok(status) => {
                    report.hypervisor_ok = true;
                    report
                        .samples
                        .push(target.sample_fields(&status, report.timestamp));
                }
                Err(e) => {
                    report.failures += 1;
                    self.metrics.inc_poll_errors();
                    warn!(
                        entity_id = %target.id(),
                        error = %e,
                        "Failed to poll entity, skipping"
                    );
                }
            }
        }

        self.metrics
            .observe_poll_latency(started.elapsed().as_secs_f64());
        debug!(
            samples = report.samples.len(),
            failures = report.failures,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Poll complete"
        );
        self.record_collector_health(&report).await;
        report
    }

    /// Await a hypervisor call under the per-call deadline
    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SentinelError::TransientNetwork(format!(
                "hypervisor call timed out after {:?}",
                self.config.call_timeout
            ))),
        }
    }

    async fn publish_samples(&self, report: &TickReport) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let mut dropped = 0usize;
        for sample in &report.samples {
            match session
                .publish(&self.config.aggregator_id, Payload::Sample(sample.clone()))
                .await
            {
                Ok(Delivery::Sent) => {}
                Ok(Delivery::Dropped) => dropped += 1,
                Err(e) => {
                    dropped += 1;
                    warn!(entity_id = %sample.sample.entity_id, error = %e, "Publish failed");
                }
            }
        }
        if dropped > 0 {
            warn!(dropped, "Samples dropped this tick, next poll supersedes them");
        }
    }

    async fn publish_heartbeat(&self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let (hypervisor_ok, entity_ids) = match &self.last_report {
            Some(r) => (
                r.hypervisor_ok,
                r.samples.iter().map(|s| s.sample.entity_id.clone()).collect(),
            ),
            None => (false, Vec::new()),
        };
        let heartbeat = Heartbeat {
            agent_id: self.config.agent_id.clone(),
            node: self.config.node.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            hypervisor_ok,
            entity_ids,
        };

        if let Err(e) = session
            .publish(&self.config.aggregator_id, Payload::Heartbeat(heartbeat))
            .await
        {
            warn!(error = %e, "Heartbeat publish failed");
        }
    }

    async fn record_collector_health(&self, report: &TickReport) {
        let failures = report.failures;
        let hypervisor_ok = report.hypervisor_ok;
        self.set_health(|h| async move {
            if !hypervisor_ok {
                h.set_degraded(components::COLLECTOR, "hypervisor API unavailable")
                    .await
            } else if failures > 0 {
                h.set_degraded(
                    components::COLLECTOR,
                    format!("{} hypervisor calls failed", failures),
                )
                .await
            } else {
                h.set_healthy(components::COLLECTOR).await
            }
        })
        .await;
    }

    async fn set_health<F, Fut>(&self, f: F)
    where
        F: FnOnce(HealthRegistry) -> Fut,
        Fut: Future<Output = ()>,
    {
        if let Some(health) = self.health.clone() {
            f(health).await;
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_inbound(inbound: &mut Option<mpsc::Receiver<Inbound>>) -> Option<Inbound> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
