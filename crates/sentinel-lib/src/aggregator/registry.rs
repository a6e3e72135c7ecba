//! Known entities and their critical flags

use crate::models::{Entity, EntityId, EntityKind, MetricSample, SampleReport};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Entities the aggregator has seen or been told about
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: Arc<RwLock<BTreeMap<EntityId, Entity>>>,
    /// Timestamp and running state of the newest sample per entity
    latest: Arc<RwLock<BTreeMap<EntityId, (i64, bool)>>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the entity behind `report` if it is unknown.
    ///
    /// Returns the new entity on first sight. A placeholder created by
    /// [`set_critical`](Self::set_critical) takes the reported kind and
    /// name but keeps its flag.
    pub fn observe(&self, report: &SampleReport) -> Option<Entity> {
        let mut entities = self.entities.write().ok()?;
        let id = &report.sample.entity_id;

        match entities.get_mut(id) {
            Some(existing) => {
                if existing.display_name == id.as_str() && report.display_name != id.as_str() {
                    existing.display_name = report.display_name.clone();
                    existing.kind = report.inferred_kind();
                }
                None
            }
            None => {
                let entity = Entity::new(
                    id.clone(),
                    report.display_name.clone(),
                    report.inferred_kind(),
                );
                entities.insert(id.clone(), entity.clone());
                Some(entity)
            }
        }
    }

    /// Set the critical flag, creating a placeholder when the entity is
    /// unknown. Idempotent.
    pub fn set_critical(&self, id: &EntityId, critical: bool) -> Entity {
        let placeholder = || {
            let mut entity = Entity::new(id.clone(), id.as_str(), kind_from_id(id));
            entity.critical = critical;
            entity
        };

        let Ok(mut entities) = self.entities.write() else {
            return placeholder();
        };
        let entity = entities.entry(id.clone()).or_insert_with(placeholder);
        entity.critical = critical;
        entity.clone()
    }

    /// Remember whether `sample` reports its entity running, unless a
    /// newer sample was already seen
    pub fn record_status(&self, sample: &MetricSample) {
        let Ok(mut latest) = self.latest.write() else {
            return;
        };
        let running = sample.is_running();
        latest
            .entry(sample.entity_id.clone())
            .and_modify(|(ts, state)| {
                if sample.timestamp >= *ts {
                    *ts = sample.timestamp;
                    *state = running;
                }
            })
            .or_insert((sample.timestamp, running));
    }

    /// Running state from the newest sample; `None` before any sample
    pub fn is_running(&self, id: &EntityId) -> Option<bool> {
        self.latest.read().ok()?.get(id).map(|(_, running)| *running)
    }

    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        self.entities.read().ok()?.get(id).cloned()
    }

    /// All entities ordered by id
    pub fn list(&self) -> Vec<Entity> {
        self.entities
            .read()
            .map(|e| e.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entities.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guests are keyed `<node>/<vmid>`, hosts by bare node name
fn kind_from_id(id: &EntityId) -> EntityKind {
    if id.as_str().contains('/') {
        EntityKind::VirtualMachine
    } else {
        EntityKind::Host
    }
}
