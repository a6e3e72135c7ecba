//! Threshold policy for forecast anomalies

use crate::models::Prediction;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CPU_THRESHOLD: f64 = 85.0;
pub const DEFAULT_MEM_THRESHOLD: f64 = 90.0;

/// Thresholds above which a forecast is anomalous
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyPolicy {
    pub cpu_threshold: f64,
    pub mem_threshold: f64,
}

impl Default for AnomalyPolicy {
    fn default() -> Self {
        Self {
            cpu_threshold: DEFAULT_CPU_THRESHOLD,
            mem_threshold: DEFAULT_MEM_THRESHOLD,
        }
    }
}

/// Which threshold a prediction crossed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Breach {
    Cpu { predicted: f64, threshold: f64 },
    Memory { predicted: f64, threshold: f64 },
}

impl std::fmt::Display for Breach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Breach::Cpu {
                predicted,
                threshold,
            } => write!(f, "cpu forecast {:.1}% > {:.1}%", predicted, threshold),
            Breach::Memory {
                predicted,
                threshold,
            } => write!(f, "memory forecast {:.1}% > {:.1}%", predicted, threshold),
        }
    }
}

impl AnomalyPolicy {
    pub fn new(cpu_threshold: f64, mem_threshold: f64) -> Self {
        Self {
            cpu_threshold,
            mem_threshold,
        }
    }

    pub fn is_anomaly(&self, predicted_cpu: f64, predicted_mem: f64) -> bool {
        predicted_cpu > self.cpu_threshold || predicted_mem > self.mem_threshold
    }

    /// Every threshold the prediction crosses, CPU first
    pub fn breaches(&self, prediction: &Prediction) -> Vec<Breach> {
        let mut breaches = Vec::new();
        if prediction.predicted_cpu > self.cpu_threshold {
            breaches.push(Breach::Cpu {
                predicted: prediction.predicted_cpu,
                threshold: self.cpu_threshold,
            });
        }
        if prediction.predicted_mem > self.mem_threshold {
            breaches.push(Breach::Memory {
                predicted: prediction.predicted_mem,
                threshold: self.mem_threshold,
            });
        }
        breaches
    }

    /// Set `is_anomaly` on each prediction; returns how many were flagged
    pub fn apply(&self, predictions: &mut [Prediction]) -> usize {
        let mut flagged = 0;
        for p in predictions.iter_mut() {
            p.is_anomaly = self.is_anomaly(p.predicted_cpu, p.predicted_mem);
            if p.is_anomaly {
                flagged += 1;
            }
        }
        flagged
    }
}
