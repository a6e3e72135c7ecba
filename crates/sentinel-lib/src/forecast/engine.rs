//! Per-entity training and prediction writing

use super::model::{ArModel, ModelSpec};
use super::series::{hour_floor, resample_hourly, HourlySeries, STEP_SECS};
use crate::anomaly::AnomalyPolicy;
use crate::error::{Result, SentinelError};
use crate::models::{Entity, EntityKind, MetricSample, Prediction};
use crate::store::MetricsStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DAY: Duration = Duration::from_secs(24 * 3600);

/// Configuration for the forecasting engine
#[derive(Debug, Clone)]
pub struct ForecastConfig {
    /// Hourly steps forecast per cycle (default: 48)
    pub horizon_hours: usize,
    /// Training window for hosts (default: 30 days)
    pub host_window: Duration,
    /// Training window for guests (default: 14 days)
    pub vm_window: Duration,
    /// Resampled points required to train a host (default: 24)
    pub host_min_points: usize,
    /// Resampled points required to train a guest (default: 12)
    pub vm_min_points: usize,
    /// Season length in hours (default: 24)
    pub seasonal_period: usize,
    /// Order of the non-seasonal model (default: 2)
    pub ar_order: usize,
    /// Normal quantile of the confidence interval (default: 1.96)
    pub confidence_z: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            horizon_hours: 48,
            host_window: DAY * 30,
            vm_window: DAY * 14,
            host_min_points: 24,
            vm_min_points: 12,
            seasonal_period: 24,
            ar_order: 2,
            confidence_z: 1.96,
        }
    }
}

impl ForecastConfig {
    pub fn with_horizon(mut self, hours: usize) -> Self {
        self.horizon_hours = hours;
        self
    }

    pub fn with_windows(mut self, host: Duration, vm: Duration) -> Self {
        self.host_window = host;
        self.vm_window = vm;
        self
    }

    pub fn with_min_points(mut self, host: usize, vm: usize) -> Self {
        self.host_min_points = host;
        self.vm_min_points = vm;
        self
    }

    pub fn window_for(&self, kind: EntityKind) -> Duration {
        match kind {
            EntityKind::Host => self.host_window,
            EntityKind::VirtualMachine => self.vm_window,
        }
    }

    pub fn min_points_for(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Host => self.host_min_points,
            EntityKind::VirtualMachine => self.vm_min_points,
        }
    }

    /// Seasonal model for hosts with two full periods of history,
    /// plain AR otherwise
    pub fn spec_for(&self, kind: EntityKind, points: usize) -> ModelSpec {
        let seasonal = ModelSpec::Seasonal {
            period: self.seasonal_period,
        };
        if kind == EntityKind::Host
            && points >= 2 * self.seasonal_period
            && points >= seasonal.min_observations()
        {
            seasonal
        } else {
            ModelSpec::NonSeasonal {
                order: self.ar_order,
            }
        }
    }
}

/// Trains one entity at a time and writes its predictions
pub struct ForecastEngine {
    store: Arc<dyn MetricsStore>,
    config: ForecastConfig,
    policy: AnomalyPolicy,
}

struct Fitted {
    cpu_mean: Vec<f64>,
    cpu_err: Vec<f64>,
    mem_mean: Vec<f64>,
}

impl ForecastEngine {
    pub fn new(store: Arc<dyn MetricsStore>, config: ForecastConfig, policy: AnomalyPolicy) -> Self {
        Self {
            store,
            config,
            policy,
        }
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    /// Train `entity` on its trailing window ending at `now` and replace its
    /// predictions for the forecast horizon.
    ///
    /// Returns `InsufficientData` without writing anything when the
    /// resampled history is too short.
    pub async fn train(&self, entity: &Entity, now: i64) -> Result<Vec<Prediction>> {
        let window = self.config.window_for(entity.kind).as_secs() as i64;
        let samples = self
            .store
            .range_samples(&entity.id, now - window, now)
            .await?;

        let series = resample_hourly(&samples);
        let required = self.config.min_points_for(entity.kind);
        if series.len() < required {
            return Err(SentinelError::InsufficientData {
                entity_id: entity.id.to_string(),
                available: series.len(),
                required,
            });
        }
        let (Some(last_bucket), Some(cutoff)) =
            (series.last_bucket(), samples.iter().map(|s| s.timestamp).max())
        else {
            return Err(SentinelError::InsufficientData {
                entity_id: entity.id.to_string(),
                available: 0,
                required,
            });
        };

        let spec = self.config.spec_for(entity.kind, series.len());
        debug!(
            entity_id = %entity.id,
            points = series.len(),
            model = spec.name(),
            "Fitting model"
        );

        let fitted = fit_off_thread(entity, series, spec, self.config.horizon_hours).await?;

        let z = self.config.confidence_z;
        let mut predictions: Vec<Prediction> = (0..self.config.horizon_hours)
            .map(|h| {
                let cpu = fitted.cpu_mean[h];
                let half_width = z * fitted.cpu_err[h];
                Prediction {
                    entity_id: entity.id.clone(),
                    generated_at: now,
                    forecast_timestamp: last_bucket + (h as i64 + 1) * STEP_SECS,
                    predicted_cpu: clamp_pct(cpu),
                    predicted_mem: clamp_pct(fitted.mem_mean[h]),
                    confidence_lower: clamp_pct(cpu - half_width),
                    confidence_upper: clamp_pct(cpu + half_width),
                    is_anomaly: false,
                }
            })
            .collect();
        debug_assert!(predictions.iter().all(|p| p.forecast_timestamp > cutoff));
        self.policy.apply(&mut predictions);

        // A job cancelled by its timeout must leave the previous forecast whole
        self.store
            .replace_predictions(&entity.id, predictions.clone())
            .await?;

        Ok(predictions)
    }
}

/// Model fitting is CPU bound, keep it off the async workers
async fn fit_off_thread(
    entity: &Entity,
    series: HourlySeries,
    spec: ModelSpec,
    horizon: usize,
) -> Result<Fitted> {
    let entity_id = entity.id.to_string();
    let task_id = entity_id.clone();

    let fitted = tokio::task::spawn_blocking(move || -> std::result::Result<Fitted, String> {
        let cpu = ArModel::fit(&series.cpu, spec)?.forecast(&series.cpu, horizon);
        let mem = ArModel::fit(&series.mem, spec)?.forecast(&series.mem, horizon);
        if cpu.mean.iter().chain(&mem.mean).chain(&cpu.std_err).any(|v| !v.is_finite()) {
            return Err(format!("{} forecast diverged", task_id));
        }
        Ok(Fitted {
            cpu_mean: cpu.mean,
            cpu_err: cpu.std_err,
            mem_mean: mem.mean,
        })
    })
    .await
    .map_err(|e| SentinelError::model_fit(&entity_id, format!("fit task failed: {}", e)))?;

    fitted.map_err(|reason| SentinelError::model_fit(entity_id, reason))
}

/// Percentages are floored and capped only when stored
fn clamp_pct(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

/// Realized-vs-predicted comparison
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccuracyReport {
    /// Predictions with a realized hourly value
    pub pairs: usize,
    pub mae_cpu: f64,
    pub mae_mem: f64,
    /// Share of realized CPU values inside the confidence interval
    pub coverage: f64,
}

/// Pair predictions with the hourly mean of realized samples
pub fn evaluate_accuracy(predictions: &[Prediction], samples: &[MetricSample]) -> AccuracyReport {
    let mut realized: BTreeMap<i64, (f64, f64, usize)> = BTreeMap::new();
    for s in samples {
        let entry = realized.entry(hour_floor(s.timestamp)).or_insert((0.0, 0.0, 0));
        entry.0 += s.cpu_pct;
        entry.1 += s.mem_pct;
        entry.2 += 1;
    }

    let mut report = AccuracyReport::default();
    let mut covered = 0usize;
    for p in predictions {
        let Some((cpu_sum, mem_sum, n)) = realized.get(&hour_floor(p.forecast_timestamp)) else {
            continue;
        };
        let cpu = cpu_sum / *n as f64;
        let mem = mem_sum / *n as f64;
        report.pairs += 1;
        report.mae_cpu += (p.predicted_cpu - cpu).abs();
        report.mae_mem += (p.predicted_mem - mem).abs();
        if (p.confidence_lower..=p.confidence_upper).contains(&cpu) {
            covered += 1;
        }
    }

    if report.pairs > 0 {
        let n = report.pairs as f64;
        report.mae_cpu /= n;
        report.mae_mem /= n;
        report.coverage = covered as f64 / n;
    }
    report
}
