//! Bounded training pool
//!
//! Runs one training job per eligible entity, at most `pool_size` at a
//! time, never two for the same entity, each under its own deadline.

use super::ForecastEngine;
use crate::error::{Result, SentinelError};
use crate::models::{Entity, EntityId, Prediction};
use crate::observability::SentinelMetrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

/// Default per-job deadline
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound on the default pool size
const MAX_DEFAULT_POOL: usize = 8;

/// min(CPU cores, 8)
pub fn default_pool_size() -> usize {
    num_cpus::get().clamp(1, MAX_DEFAULT_POOL)
}

/// Configuration for the training pool
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub pool_size: usize,
    pub job_timeout: Duration,
    /// Capacity of the outcome channel
    pub outcome_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            outcome_buffer: 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }
}

/// What a trigger did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub scheduled: usize,
    /// Entities whose previous job is still running
    pub skipped_in_flight: usize,
    /// Entities with fewer samples than their kind requires
    pub skipped_insufficient_data: usize,
    /// Entities whose latest sample says they are stopped or offline
    pub skipped_not_running: usize,
}

/// Result of one training job
#[derive(Debug)]
pub struct JobOutcome {
    pub entity: Entity,
    pub cycle: u64,
    pub elapsed: Duration,
    pub result: Result<Vec<Prediction>>,
}

/// Removes the in-flight marker however the job ends
struct InFlightGuard {
    in_flight: Arc<DashMap<EntityId, u64>>,
    entity_id: EntityId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.entity_id);
    }
}

/// Bounded worker pool with an at-most-one-in-flight guard per entity
pub struct TrainingScheduler {
    engine: Arc<ForecastEngine>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    /// Entity → cycle of the running job
    in_flight: Arc<DashMap<EntityId, u64>>,
    outcomes: mpsc::Sender<JobOutcome>,
    metrics: SentinelMetrics,
}

impl TrainingScheduler {
    /// Create the scheduler and the stream of job outcomes
    pub fn new(
        engine: Arc<ForecastEngine>,
        config: SchedulerConfig,
    ) -> (Self, mpsc::Receiver<JobOutcome>) {
        let (outcomes, rx) = mpsc::channel(config.outcome_buffer.max(1));
        let scheduler = Self {
            engine,
            permits: Arc::new(Semaphore::new(config.pool_size.max(1))),
            config,
            in_flight: Arc::new(DashMap::new()),
            outcomes,
            metrics: SentinelMetrics::new(),
        };
        (scheduler, rx)
    }

    pub fn is_in_flight(&self, entity_id: &EntityId) -> bool {
        self.in_flight.contains_key(entity_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Enqueue a job for every entity that has none running.
    ///
    /// An entity whose job is still in flight is skipped, not queued.
    pub fn trigger(&self, entities: Vec<Entity>, cycle: u64, now: i64) -> CycleReport {
        let mut report = CycleReport {
            cycle,
            ..Default::default()
        };

        for entity in entities {
            match self.in_flight.entry(entity.id.clone()) {
                Entry::Occupied(running) => {
                    debug!(
                        entity_id = %entity.id,
                        running_cycle = *running.get(),
                        "Training still in flight, skipping"
                    );
                    report.skipped_in_flight += 1;
                    self.metrics.inc_training_skipped("in_flight");
                }
                Entry::Vacant(slot) => {
                    slot.insert(cycle);
                    let guard = InFlightGuard {
                        in_flight: self.in_flight.clone(),
                        entity_id: entity.id.clone(),
                    };
                    self.spawn_job(entity, cycle, now, guard);
                    report.scheduled += 1;
                }
            }
        }

        report
    }

    fn spawn_job(&self, entity: Entity, cycle: u64, now: i64, guard: InFlightGuard) {
        let engine = self.engine.clone();
        let permits = self.permits.clone();
        let outcomes = self.outcomes.clone();
        let timeout = self.config.job_timeout;
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, engine.train(&entity, now)).await {
                Ok(result) => result,
                Err(_) => Err(SentinelError::TrainingTimeout {
                    entity_id: entity.id.to_string(),
                    timeout,
                }),
            };
            let elapsed = started.elapsed();
            metrics.observe_training_latency(elapsed.as_secs_f64());

            match &result {
                Ok(predictions) => {
                    metrics.add_predictions_written(predictions.len() as u64);
                    let flagged = predictions.iter().filter(|p| p.is_anomaly).count();
                    metrics.add_anomalies_flagged(flagged as u64);
                }
                Err(e) => metrics.inc_training_skipped(e.kind().as_str()),
            }

            // Release the entity before reporting so a follow-up trigger
            // from the outcome handler is not skipped
            drop(guard);

            let outcome = JobOutcome {
                entity,
                cycle,
                elapsed,
                result,
            };
            if outcomes.send(outcome).await.is_err() {
                warn!("Outcome receiver dropped");
            }
        });
    }
}
