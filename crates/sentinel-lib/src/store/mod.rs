//! Metrics and predictions store
//!
//! The durable time-series store is an external collaborator; this module
//! defines the boundary the aggregator and forecaster consume, plus an
//! in-memory implementation with optional JSON snapshot persistence.

mod memory;

pub use memory::{InMemoryStore, StoreConfig};

use crate::error::Result;
use crate::models::{EntityId, MetricSample, Prediction};
use async_trait::async_trait;

/// Storage boundary for samples and predictions
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Insert or replace the sample keyed by `(entity_id, timestamp)`
    async fn upsert_sample(&self, sample: MetricSample) -> Result<()>;

    /// Samples with `start <= timestamp <= end`, ascending by timestamp
    async fn range_samples(
        &self,
        entity_id: &EntityId,
        start: i64,
        end: i64,
    ) -> Result<Vec<MetricSample>>;

    /// Number of stored samples for an entity
    async fn sample_count(&self, entity_id: &EntityId) -> Result<usize>;

    /// Insert or replace the prediction keyed by
    /// `(entity_id, forecast_timestamp)`
    async fn upsert_prediction(&self, prediction: Prediction) -> Result<()>;

    /// Remove predictions for `entity_id` at the given forecast timestamps.
    /// Returns how many existed.
    async fn delete_predictions(
        &self,
        entity_id: &EntityId,
        forecast_timestamps: &[i64],
    ) -> Result<usize>;

    /// Store a freshly generated forecast for `entity_id` in one step,
    /// superseding predictions at the same forecast timestamps. Readers
    /// never observe a partially written forecast. Returns how many
    /// predictions were superseded.
    async fn replace_predictions(
        &self,
        entity_id: &EntityId,
        predictions: Vec<Prediction>,
    ) -> Result<usize>;

    /// Current predictions for an entity, ascending by forecast timestamp
    async fn predictions_for(&self, entity_id: &EntityId) -> Result<Vec<Prediction>>;

    /// Earliest upcoming prediction per entity at or after `now`
    async fn latest_predictions(&self, now: i64) -> Result<Vec<Prediction>>;
}
