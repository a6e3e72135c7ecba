//! Single writer for ingested samples
//!
//! Every sample upsert goes through one task so writes land in the order
//! they were accepted, whatever handler task accepted them.

use crate::error::{Result, SentinelError};
use crate::models::MetricSample;
use crate::store::MetricsStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

struct WriteRequest {
    sample: MetricSample,
    ack: oneshot::Sender<Result<()>>,
}

/// Handle to the writer task
#[derive(Clone)]
pub struct StoreWriter {
    requests: mpsc::Sender<WriteRequest>,
}

impl StoreWriter {
    /// Start the writer task over `store`. It stops once every handle is
    /// dropped.
    pub fn spawn(store: Arc<dyn MetricsStore>, buffer: usize) -> (Self, JoinHandle<()>) {
        let (requests, mut rx) = mpsc::channel::<WriteRequest>(buffer.max(1));

        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = store.upsert_sample(request.sample).await;
                // The caller may have given up waiting
                let _ = request.ack.send(result);
            }
            debug!("Store writer stopped");
        });

        (Self { requests }, task)
    }

    /// Queue `sample` and wait until it is stored
    pub async fn upsert_sample(&self, sample: MetricSample) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.requests
            .send(WriteRequest { sample, ack })
            .await
            .map_err(|_| SentinelError::Store("store writer stopped".to_string()))?;
        done.await
            .map_err(|_| SentinelError::Store("store writer dropped request".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityId;
    use crate::store::InMemoryStore;

    fn sample(ts: i64, cpu: f64) -> MetricSample {
        MetricSample {
            entity_id: EntityId::new("vm-101"),
            timestamp: ts,
            cpu_pct: cpu,
            mem_pct: 10.0,
            disk_used: 0,
            net_in: 0,
            net_out: 0,
            status: "running".to_string(),
        }
    }

    #[tokio::test]
    async fn test_writes_apply_in_submission_order() {
        let store = Arc::new(InMemoryStore::new());
        let (writer, _task) = StoreWriter::spawn(store.clone(), 8);

        for cpu in [10.0, 20.0, 30.0] {
            writer.upsert_sample(sample(100, cpu)).await.unwrap();
        }
        writer.upsert_sample(sample(200, 5.0)).await.unwrap();

        let stored = store
            .range_samples(&EntityId::new("vm-101"), 0, 1_000)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].cpu_pct, 30.0);
    }

    #[tokio::test]
    async fn test_stopped_writer_reports_store_error() {
        let store = Arc::new(InMemoryStore::new());
        let (writer, task) = StoreWriter::spawn(store, 1);
        task.abort();
        let _ = task.await;

        let err = writer.upsert_sample(sample(100, 1.0)).await.unwrap_err();
        assert!(matches!(err, SentinelError::Store(_)));
    }
}
