//! Forecasting engine
//!
//! This module provides:
//! - Hourly resampling of raw samples ([`resample_hourly`])
//! - Seasonal and non-seasonal autoregressive models ([`ArModel`])
//! - [`ForecastEngine`], which trains one entity and writes its predictions
//! - [`TrainingScheduler`], a bounded worker pool that keeps at most one
//!   training job in flight per entity

mod engine;
mod model;
mod scheduler;
mod series;


pub use engine::{evaluate_accuracy, AccuracyReport, ForecastConfig, ForecastEngine};
pub use model::{ArModel, Forecast, ModelSpec};
pub use scheduler::{default_pool_size, CycleReport, JobOutcome, SchedulerConfig, TrainingScheduler};
pub use series::{hour_floor, resample_hourly, HourlySeries, STEP_SECS};
