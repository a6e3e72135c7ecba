//! Anomaly and critical-resource policy
//!
//! This module provides:
//! - [`AnomalyPolicy`], the threshold check that marks predictions anomalous
//! - [`CriticalAlerter`], which turns anomalous forecasts of critical
//!   entities into at most one [`CriticalAlert`](crate::models::CriticalAlert)
//!   per entity per forecast cycle

mod alerter;
mod policy;

pub use alerter::CriticalAlerter;
pub use policy::{AnomalyPolicy, Breach, DEFAULT_CPU_THRESHOLD, DEFAULT_MEM_THRESHOLD};
