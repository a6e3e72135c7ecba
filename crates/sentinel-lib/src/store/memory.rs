//! In-memory store with optional JSON snapshot persistence

use super::MetricsStore;
use crate::error::{Result, SentinelError};
use crate::models::{EntityId, MetricSample, Prediction};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for the in-memory store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Snapshot file; `None` keeps everything in memory only
    pub persistence_path: Option<PathBuf>,
    /// Minimum time between snapshot writes
    pub flush_interval: Duration,
    /// Samples and predictions older than this are pruned; `None` keeps
    /// everything
    pub retention: Option<Duration>,
}

/// Default retention, longer than the widest training window
const DEFAULT_RETENTION: Duration = Duration::from_secs(35 * 24 * 3600);

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            persistence_path: None,
            flush_interval: Duration::from_secs(60),
            retention: Some(DEFAULT_RETENTION),
        }
    }
}

type Key = (EntityId, i64);

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    samples: Vec<MetricSample>,
    predictions: Vec<Prediction>,
}

/// Ordered in-memory store keyed by `(entity_id, timestamp)`
pub struct InMemoryStore {
    samples: RwLock<BTreeMap<Key, MetricSample>>,
    predictions: RwLock<BTreeMap<Key, Prediction>>,
    config: StoreConfig,
    dirty: AtomicBool,
    last_flush: std::sync::Mutex<Instant>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            samples: RwLock::new(BTreeMap::new()),
            predictions: RwLock::new(BTreeMap::new()),
            config,
            dirty: AtomicBool::new(false),
            last_flush: std::sync::Mutex::new(Instant::now()),
        }
    }

    /// Open a store backed by `path`, loading an existing snapshot if any
    pub fn with_persistence(path: PathBuf) -> Result<Self> {
        Self::open(StoreConfig {
            persistence_path: Some(path),
            ..Default::default()
        })
    }

    /// Open a store with `config`, loading the snapshot it points at
    pub fn open(config: StoreConfig) -> Result<Self> {
        let path = config.persistence_path.clone();
        let store = Self::with_config(config);

        if let Some(path) = path.filter(|p| p.exists()) {
            match load_snapshot(&path) {
                Ok(snapshot) => store.restore(snapshot),
                Err(e) => warn!(error = %e, "Failed to load store snapshot, starting fresh"),
            }
        }
        Ok(store)
    }

    fn restore(&self, snapshot: Snapshot) {
        let samples = snapshot.samples.len();
        let predictions = snapshot.predictions.len();

        // Only called during construction, nothing else holds the locks
        if let Ok(mut map) = self.samples.try_write() {
            for s in snapshot.samples {
                map.insert((s.entity_id.clone(), s.timestamp), s);
            }
        }
        if let Ok(mut map) = self.predictions.try_write() {
            for p in snapshot.predictions {
                map.insert((p.entity_id.clone(), p.forecast_timestamp), p);
            }
        }
        info!(samples, predictions, "Restored store snapshot");
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Drop samples and predictions that fell out of the retention horizon.
    /// Returns how many entries were removed.
    pub async fn prune(&self, now: i64) -> usize {
        let Some(retention) = self.config.retention else {
            return 0;
        };
        let cutoff = now.saturating_sub(retention.as_secs() as i64);

        let mut removed = 0;
        {
            let mut samples = self.samples.write().await;
            let before = samples.len();
            samples.retain(|(_, ts), _| *ts >= cutoff);
            removed += before - samples.len();
        }
        {
            let mut predictions = self.predictions.write().await;
            let before = predictions.len();
            predictions.retain(|(_, ts), _| *ts >= cutoff);
            removed += before - predictions.len();
        }

        if removed > 0 {
            self.mark_dirty();
            debug!(removed, cutoff, "Pruned entries past retention");
        }
        removed
    }

    /// Whether a snapshot write is due
    pub fn should_flush(&self) -> bool {
        let elapsed = self
            .last_flush
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        self.dirty.load(Ordering::Acquire)
            && self.config.persistence_path.is_some()
            && elapsed >= self.config.flush_interval
    }

    /// Write a snapshot if persistence is enabled and data changed
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = self.config.persistence_path.as_ref() else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let snapshot = Snapshot {
            samples: self.samples.read().await.values().cloned().collect(),
            predictions: self.predictions.read().await.values().cloned().collect(),
        };

        let path = path.clone();
        let entries = snapshot.samples.len() + snapshot.predictions.len();
        let written = tokio::task::spawn_blocking(move || save_snapshot(&path, &snapshot))
            .await
            .map_err(|e| SentinelError::Store(format!("flush task failed: {}", e)))?;

        if let Err(e) = written {
            self.mark_dirty();
            return Err(e);
        }
        if let Ok(mut last) = self.last_flush.lock() {
            *last = Instant::now();
        }
        debug!(entries, "Store flushed to disk");
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let io_err = |what: &str, e: std::io::Error| {
        SentinelError::Store(format!("{} {}: {}", what, path.display(), e))
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err("create dir for", e))?;
    }

    let json = serde_json::to_vec(snapshot)
        .map_err(|e| SentinelError::Store(format!("serialize snapshot: {}", e)))?;

    // Write atomically using temp file
    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(|e| io_err("open temp for", e))?;
    file.write_all(&json).map_err(|e| io_err("write", e))?;
    file.sync_all().map_err(|e| io_err("sync", e))?;

    std::fs::rename(&temp_path, path).map_err(|e| io_err("rename into", e))?;
    Ok(())
}

fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let bytes = std::fs::read(path)
        .map_err(|e| SentinelError::Store(format!("read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SentinelError::Store(format!("parse {}: {}", path.display(), e)))
}

#[async_trait]
impl MetricsStore for InMemoryStore {
    async fn upsert_sample(&self, sample: MetricSample) -> Result<()> {
        let key = (sample.entity_id.clone(), sample.timestamp);
        self.samples.write().await.insert(key, sample);
        self.mark_dirty();
        Ok(())
    }

    async fn range_samples(
        &self,
        entity_id: &EntityId,
        start: i64,
        end: i64,
    ) -> Result<Vec<MetricSample>> {
        if start > end {
            return Ok(Vec::new());
        }
        let samples = self.samples.read().await;
        Ok(samples
            .range((entity_id.clone(), start)..=(entity_id.clone(), end))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn sample_count(&self, entity_id: &EntityId) -> Result<usize> {
        let samples = self.samples.read().await;
        Ok(samples
            .range((entity_id.clone(), i64::MIN)..=(entity_id.clone(), i64::MAX))
            .count())
    }

    async fn upsert_prediction(&self, prediction: Prediction) -> Result<()> {
        let key = (prediction.entity_id.clone(), prediction.forecast_timestamp);
        self.predictions.write().await.insert(key, prediction);
        self.mark_dirty();
        Ok(())
    }

    async fn delete_predictions(
        &self,
        entity_id: &EntityId,
        forecast_timestamps: &[i64],
    ) -> Result<usize> {
        let mut predictions = self.predictions.write().await;
        let removed = forecast_timestamps
            .iter()
            .filter(|ts| predictions.remove(&(entity_id.clone(), **ts)).is_some())
            .count();
        if removed > 0 {
            self.mark_dirty();
        }
        Ok(removed)
    }

    async fn replace_predictions(
        &self,
        entity_id: &EntityId,
        predictions: Vec<Prediction>,
    ) -> Result<usize> {
        if let Some(stray) = predictions.iter().find(|p| p.entity_id != *entity_id) {
            return Err(SentinelError::validation(format!(
                "prediction for {} in forecast of {}",
                stray.entity_id, entity_id
            )));
        }

        let mut stored = self.predictions.write().await;
        let superseded = predictions
            .into_iter()
            .filter_map(|p| stored.insert((entity_id.clone(), p.forecast_timestamp), p))
            .count();
        self.mark_dirty();
        Ok(superseded)
    }

    async fn predictions_for(&self, entity_id: &EntityId) -> Result<Vec<Prediction>> {
        let predictions = self.predictions.read().await;
        Ok(predictions
            .range((entity_id.clone(), i64::MIN)..=(entity_id.clone(), i64::MAX))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn latest_predictions(&self, now: i64) -> Result<Vec<Prediction>> {
        let predictions = self.predictions.read().await;
        let mut latest: BTreeMap<&EntityId, &Prediction> = BTreeMap::new();
        for ((entity_id, ts), prediction) in predictions.iter() {
            if *ts >= now {
                latest.entry(entity_id).or_insert(prediction);
            }
        }
        Ok(latest.into_values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(entity: &str, ts: i64, cpu: f64) -> MetricSample {
        MetricSample {
            entity_id: EntityId::new(entity),
            timestamp: ts,
            cpu_pct: cpu,
            mem_pct: 50.0,
            disk_used: 0,
            net_in: 0,
            net_out: 0,
            status: "running".to_string(),
        }
    }

    fn prediction(entity: &str, ts: i64, cpu: f64) -> Prediction {
        Prediction {
            entity_id: EntityId::new(entity),
            generated_at: 0,
            forecast_timestamp: ts,
            predicted_cpu: cpu,
            predicted_mem: 10.0,
            confidence_lower: 0.0,
            confidence_upper: 100.0,
            is_anomaly: false,
        }
    }

    #[tokio::test]
    async fn test_duplicate_sample_last_write_wins() {
        let store = InMemoryStore::new();
        let id = EntityId::new("vm-101");

        store.upsert_sample(sample("vm-101", 1000, 10.0)).await.unwrap();
        store.upsert_sample(sample("vm-101", 1000, 55.0)).await.unwrap();

        let rows = store.range_samples(&id, 0, 2000).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cpu_pct, 55.0);
        assert_eq!(store.sample_count(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_range_sorted_and_scoped_to_entity() {
        let store = InMemoryStore::new();
        for ts in [300, 100, 200] {
            store.upsert_sample(sample("pve1", ts, 1.0)).await.unwrap();
        }
        store.upsert_sample(sample("pve10", 150, 1.0)).await.unwrap();
        store.upsert_sample(sample("pve0", 150, 1.0)).await.unwrap();

        let rows = store
            .range_samples(&EntityId::new("pve1"), 100, 250)
            .await
            .unwrap();
        let stamps: Vec<i64> = rows.iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![100, 200]);

        assert!(store
            .range_samples(&EntityId::new("pve1"), 500, 100)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_prediction_supersession() {
        let store = InMemoryStore::new();
        let id = EntityId::new("pve1");

        store.upsert_prediction(prediction("pve1", 3600, 10.0)).await.unwrap();
        store.upsert_prediction(prediction("pve1", 3600, 20.0)).await.unwrap();
        let current = store.predictions_for(&id).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].predicted_cpu, 20.0);

        assert_eq!(store.delete_predictions(&id, &[3600, 7200]).await.unwrap(), 1);
        assert_eq!(store.delete_predictions(&id, &[3600]).await.unwrap(), 0);
        assert!(store.predictions_for(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_predictions_supersedes_in_one_step() {
        let store = InMemoryStore::new();
        let id = EntityId::new("pve1");
        for ts in [3600, 7200] {
            store.upsert_prediction(prediction("pve1", ts, 10.0)).await.unwrap();
        }

        let fresh = vec![prediction("pve1", 7200, 30.0), prediction("pve1", 10800, 40.0)];
        assert_eq!(store.replace_predictions(&id, fresh).await.unwrap(), 1);

        let cpu: Vec<(i64, f64)> = store
            .predictions_for(&id)
            .await
            .unwrap()
            .iter()
            .map(|p| (p.forecast_timestamp, p.predicted_cpu))
            .collect();
        assert_eq!(cpu, vec![(3600, 10.0), (7200, 30.0), (10800, 40.0)]);

        // A forecast carrying another entity's row is rejected untouched
        let mixed = vec![prediction("pve1", 3600, 99.0), prediction("vm-101", 3600, 99.0)];
        assert!(store.replace_predictions(&id, mixed).await.is_err());
        assert_eq!(store.predictions_for(&id).await.unwrap()[0].predicted_cpu, 10.0);
    }

    #[tokio::test]
    async fn test_prune_drops_entries_past_retention() {
        let store = InMemoryStore::with_config(StoreConfig {
            retention: Some(Duration::from_secs(3600)),
            ..Default::default()
        });
        let now = 1_700_000_000;
        let id = EntityId::new("pve1");

        store.upsert_sample(sample("pve1", now - 7200, 1.0)).await.unwrap();
        store.upsert_sample(sample("pve1", now - 3600, 2.0)).await.unwrap();
        store.upsert_sample(sample("pve1", now - 60, 3.0)).await.unwrap();
        store.upsert_prediction(prediction("pve1", now - 5000, 1.0)).await.unwrap();
        store.upsert_prediction(prediction("pve1", now + 3600, 1.0)).await.unwrap();

        assert_eq!(store.prune(now).await, 2);
        let stamps: Vec<i64> = store
            .range_samples(&id, i64::MIN, i64::MAX)
            .await
            .unwrap()
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(stamps, vec![now - 3600, now - 60]);
        assert_eq!(store.predictions_for(&id).await.unwrap().len(), 1);

        // Nothing left to prune
        assert_eq!(store.prune(now).await, 0);
    }

    #[tokio::test]
    async fn test_prune_disabled_without_retention() {
        let store = InMemoryStore::with_config(StoreConfig {
            retention: None,
            ..Default::default()
        });
        store.upsert_sample(sample("pve1", 100, 1.0)).await.unwrap();
        assert_eq!(store.prune(1_700_000_000).await, 0);
        assert_eq!(store.sample_count(&EntityId::new("pve1")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_latest_prediction_per_entity() {
        let store = InMemoryStore::new();
        for (entity, ts) in [("a", 100), ("a", 200), ("a", 300), ("b", 250)] {
            store.upsert_prediction(prediction(entity, ts, 1.0)).await.unwrap();
        }

        let latest = store.latest_predictions(150).await.unwrap();
        let pairs: Vec<(String, i64)> = latest
            .iter()
            .map(|p| (p.entity_id.to_string(), p.forecast_timestamp))
            .collect();
        assert_eq!(pairs, vec![("a".to_string(), 200), ("b".to_string(), 250)]);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store").join("snapshot.json");

        {
            let store = InMemoryStore::with_persistence(path.clone()).unwrap();
            store.upsert_sample(sample("pve1", 100, 5.0)).await.unwrap();
            store.upsert_prediction(prediction("pve1", 3700, 7.0)).await.unwrap();
            store.flush().await.unwrap();
        }

        let reopened = InMemoryStore::with_persistence(path).unwrap();
        let id = EntityId::new("pve1");
        assert_eq!(reopened.sample_count(&id).await.unwrap(), 1);
        assert_eq!(reopened.predictions_for(&id).await.unwrap()[0].predicted_cpu, 7.0);
    }

    #[tokio::test]
    async fn test_flush_without_persistence_is_noop() {
        let store = InMemoryStore::new();
        store.upsert_sample(sample("pve1", 100, 5.0)).await.unwrap();
        store.flush().await.unwrap();
        assert!(!store.should_flush());
    }
}
