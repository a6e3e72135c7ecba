//! Critical-alert emission with per-cycle deduplication

use super::AnomalyPolicy;
use crate::models::{CriticalAlert, Entity, EntityId, Prediction};
use std::collections::HashMap;
use std::sync::Mutex;

/// Gate between anomalous forecasts and the watchdog
///
/// Emits at most one alert per entity per forecast cycle. With
/// `suppression_cycles = n`, an entity that alerted in cycle `c` stays
/// silent through cycle `c + n`.
pub struct CriticalAlerter {
    policy: AnomalyPolicy,
    suppression_cycles: u64,
    /// Entity → cycle of the last emitted alert
    last_alert: Mutex<HashMap<EntityId, u64>>,
}

impl CriticalAlerter {
    pub fn new(policy: AnomalyPolicy) -> Self {
        Self {
            policy,
            suppression_cycles: 0,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_suppression_cycles(mut self, cycles: u64) -> Self {
        self.suppression_cycles = cycles;
        self
    }

    pub fn policy(&self) -> &AnomalyPolicy {
        &self.policy
    }

    fn should_suppress(&self, entity_id: &EntityId, cycle: u64) -> bool {
        let Ok(last) = self.last_alert.lock() else {
            return false;
        };
        match last.get(entity_id) {
            Some(&last_cycle) => cycle <= last_cycle.saturating_add(self.suppression_cycles),
            None => false,
        }
    }

    fn record_alert(&self, entity_id: &EntityId, cycle: u64) {
        if let Ok(mut last) = self.last_alert.lock() {
            last.insert(entity_id.clone(), cycle);
        }
    }

    /// Evaluate one threshold check for `entity` in `cycle`.
    ///
    /// Returns an alert only if the entity is critical, some prediction
    /// crosses a threshold and the entity has not alerted within the
    /// suppression window.
    pub fn evaluate(
        &self,
        entity: &Entity,
        predictions: &[Prediction],
        cycle: u64,
        now: i64,
    ) -> Option<CriticalAlert> {
        if !entity.critical {
            return None;
        }

        let (prediction, breach) = predictions.iter().find_map(|p| {
            self.policy
                .breaches(p)
                .into_iter()
                .next()
                .map(|breach| (p, breach))
        })?;

        if self.should_suppress(&entity.id, cycle) {
            return None;
        }
        self.record_alert(&entity.id, cycle);

        Some(CriticalAlert {
            entity_id: entity.id.clone(),
            reason: format!(
                "{} at {}",
                breach,
                chrono::DateTime::<chrono::Utc>::from_timestamp(prediction.forecast_timestamp, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| prediction.forecast_timestamp.to_string())
            ),
            cycle,
            raised_at: now,
        })
    }

    /// Forget entities no longer tracked
    pub fn forget(&self, entity_id: &EntityId) {
        if let Ok(mut last) = self.last_alert.lock() {
            last.remove(entity_id);
        }
    }
}
