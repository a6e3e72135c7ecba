//! Tests for the aggregator
//!
//! These tests verify:
//! - Samples delivered through the broker are stored last-write-wins
//! - Unknown entities register themselves and bad input is dropped
//! - Liveness follows heartbeats, silence and presence
//! - Critical entities alert at most once per cycle
//! - Forecast triggers honor the kind filter and skip stopped entities

use super::*;
use crate::error::ErrorKind;
use crate::forecast::STEP_SECS;
use crate::models::{AgentStatus, EntityKind, MetricSample};
use crate::store::InMemoryStore;
use crate::transport::{Broker, BrokerConfig, Credentials, LocalTransport, Session, Transport};
use std::future::Future;

fn sample(entity_id: EntityId, ts: i64, cpu: f64) -> MetricSample {
    MetricSample {
        entity_id,
        timestamp: ts,
        cpu_pct: cpu,
        mem_pct: 40.0,
        disk_used: 0,
        net_in: 0,
        net_out: 0,
        status: "running".to_string(),
    }
}

fn guest_report(vmid: u32, ts: i64, cpu: f64) -> SampleReport {
    SampleReport {
        sample: sample(EntityId::guest("pve1", vmid), ts, cpu),
        node: "pve1".to_string(),
        vmid: Some(vmid),
        display_name: format!("vm-{}", vmid),
    }
}

fn host_report(node: &str, ts: i64, cpu: f64) -> SampleReport {
    SampleReport {
        sample: sample(EntityId::host(node), ts, cpu),
        node: node.to_string(),
        vmid: None,
        display_name: node.to_string(),
    }
}

fn heartbeat(agent_id: &str, hypervisor_ok: bool) -> Heartbeat {
    Heartbeat {
        agent_id: agent_id.to_string(),
        node: "pve1".to_string(),
        timestamp: unix_now(),
        hypervisor_ok,
        entity_ids: vec![EntityId::host("pve1")],
    }
}

fn prediction(entity_id: &EntityId, ts: i64, cpu: f64) -> Prediction {
    Prediction {
        entity_id: entity_id.clone(),
        generated_at: 0,
        forecast_timestamp: ts,
        predicted_cpu: cpu,
        predicted_mem: 40.0,
        confidence_lower: cpu - 5.0,
        confidence_upper: cpu + 5.0,
        is_anomaly: cpu > 85.0,
    }
}

fn aggregator(store: Arc<InMemoryStore>) -> Arc<Aggregator> {
    Arc::new(Aggregator::new(AggregatorConfig::default(), store))
}

fn broker() -> Arc<Broker> {
    let broker = Broker::new(BrokerConfig::default());
    broker.add_credentials("cerebro", "c-secret");
    broker.add_credentials("monitor-pve1", "m-secret");
    broker
}

/// Connect `aggregator` to the broker as `cerebro` and a monitor session
async fn wire(broker: &Arc<Broker>, aggregator: Arc<Aggregator>) -> (Session, Session) {
    let transport = LocalTransport::new(broker.clone());
    let cerebro = transport
        .connect("cerebro", &Credentials::new("c-secret"))
        .await
        .unwrap();
    cerebro.subscribe(aggregator).unwrap();
    let monitor = transport
        .connect("monitor-pve1", &Credentials::new("m-secret"))
        .await
        .unwrap();
    (cerebro, monitor)
}

/// Poll `check` until it holds or three seconds pass
async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

mod ingestion_tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_delivery_last_write_wins() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(store.clone());
        let broker = broker();
        let (_cerebro, monitor) = wire(&broker, aggregator.clone()).await;

        // A transport retry delivers the same key twice with different payloads
        let id = EntityId::new("vm-101");
        let t = 1_700_000_000;
        for cpu in [12.0, 34.0] {
            let report = SampleReport {
                sample: sample(id.clone(), t, cpu),
                node: "pve1".to_string(),
                vmid: Some(101),
                display_name: "vm-101".to_string(),
            };
            monitor.publish("cerebro", Payload::Sample(report)).await.unwrap();
        }

        let stored = eventually(|| {
            let store = store.clone();
            let id = id.clone();
            async move {
                let rows = store.range_samples(&id, t, t).await.unwrap();
                rows.len() == 1 && rows[0].cpu_pct == 34.0
            }
        })
        .await;
        assert!(stored);
        assert_eq!(store.sample_count(&id).await.unwrap(), 1);
        assert_eq!(aggregator.agent("monitor-pve1").unwrap().status, AgentStatus::Online);
    }

    #[tokio::test]
    async fn test_unknown_entities_register_on_first_sample() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(store);

        aggregator
            .on_sample("monitor-pve1", host_report("pve1", 1_700_000_000, 10.0))
            .await
            .unwrap();
        aggregator
            .on_sample("monitor-pve1", guest_report(101, 1_700_000_000, 20.0))
            .await
            .unwrap();
        aggregator
            .on_sample("monitor-pve1", guest_report(101, 1_700_000_030, 25.0))
            .await
            .unwrap();

        let entities = aggregator.entities();
        assert_eq!(entities.len(), 2);
        assert_eq!(
            aggregator.entity(&EntityId::host("pve1")).unwrap().kind,
            EntityKind::Host
        );
        let guest = aggregator.entity(&EntityId::guest("pve1", 101)).unwrap();
        assert_eq!(guest.kind, EntityKind::VirtualMachine);
        assert_eq!(guest.display_name, "vm-101");
        assert!(!guest.critical);

        let agent = aggregator.agent("monitor-pve1").unwrap();
        assert_eq!(agent.entity_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_input_is_dropped_and_ingestion_continues() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(store.clone());

        let err = aggregator
            .on_sample("monitor-pve1", guest_report(101, 1_700_000_000, 150.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(aggregator.entities().is_empty());

        // Undecodable envelopes are swallowed by the handler
        aggregator
            .on_message(
                "monitor-pve1",
                Envelope {
                    sender: "monitor-pve1".to_string(),
                    kind: 1,
                    body: None,
                },
            )
            .await;
        aggregator
            .on_message(
                "monitor-pve1",
                Payload::Sample(guest_report(102, 1_700_000_000, f64::NAN))
                    .into_envelope("monitor-pve1"),
            )
            .await;

        aggregator
            .on_sample("monitor-pve1", guest_report(101, 1_700_000_060, 15.0))
            .await
            .unwrap();
        assert_eq!(
            store
                .sample_count(&EntityId::guest("pve1", 101))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.sample_count(&EntityId::guest("pve1", 102)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_critical_before_first_sample() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(store);
        let id = EntityId::guest("pve1", 300);

        let placeholder = aggregator.set_critical(&id, true);
        assert!(placeholder.critical);
        assert_eq!(aggregator.set_critical(&id, true), placeholder);

        aggregator
            .on_sample("monitor-pve1", guest_report(300, 1_700_000_000, 50.0))
            .await
            .unwrap();
        let entity = aggregator.entity(&id).unwrap();
        assert!(entity.critical);
        assert_eq!(entity.display_name, "vm-300");
        assert_eq!(aggregator.entities().len(), 1);
    }
}

mod liveness_tests {
    use super::*;

    #[tokio::test]
    async fn test_heartbeats_and_silence_drive_status() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(store);

        aggregator.on_heartbeat("monitor-pve1", heartbeat("monitor-pve1", true));
        let seen = aggregator.agent("monitor-pve1").unwrap().last_seen;
        assert_eq!(aggregator.agent("monitor-pve1").unwrap().status, AgentStatus::Online);

        let changes = aggregator.sweep(seen + 91);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, AgentStatus::Stale);

        let changes = aggregator.sweep(seen + 301);
        assert_eq!(changes[0].to, AgentStatus::Offline);

        // A heartbeat reporting a failing hypervisor still proves liveness
        aggregator.on_heartbeat("monitor-pve1", heartbeat("monitor-pve1", false));
        let agent = aggregator.agent("monitor-pve1").unwrap();
        assert_eq!(agent.status, AgentStatus::Online);
        assert!(!agent.hypervisor_ok);
    }

    #[tokio::test]
    async fn test_peer_offline_marks_agent_stale() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(store);
        let broker = broker();
        let (_cerebro, monitor) = wire(&broker, aggregator.clone()).await;

        monitor
            .publish("cerebro", Payload::Heartbeat(heartbeat("monitor-pve1", true)))
            .await
            .unwrap();
        assert!(
            eventually(|| {
                let aggregator = aggregator.clone();
                async move { aggregator.agent("monitor-pve1").is_some() }
            })
            .await
        );

        broker.disconnect("monitor-pve1");
        assert!(
            eventually(|| {
                let aggregator = aggregator.clone();
                async move {
                    aggregator.agent("monitor-pve1").map(|a| a.status) == Some(AgentStatus::Stale)
                }
            })
            .await
        );
    }
}

mod forecast_tests {
    use super::*;

    fn outcome(entity: Entity, cycle: u64, result: Result<Vec<Prediction>>) -> JobOutcome {
        JobOutcome {
            entity,
            cycle,
            elapsed: Duration::from_millis(5),
            result,
        }
    }

    #[tokio::test]
    async fn test_one_alert_per_cycle_for_critical_entity() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(store);
        let mut alerts = aggregator.subscribe_alerts();
        let id = EntityId::host("pve1");
        let entity = aggregator.set_critical(&id, true);

        // Three hours over the CPU threshold in the same forecast
        let predictions = vec![
            prediction(&id, 3600, 88.0),
            prediction(&id, 7200, 91.0),
            prediction(&id, 10800, 95.0),
        ];
        let first = aggregator
            .handle_outcome(outcome(entity.clone(), 1, Ok(predictions.clone())), 100)
            .await;
        let repeat = aggregator
            .handle_outcome(outcome(entity.clone(), 1, Ok(predictions.clone())), 100)
            .await;

        let alert = first.unwrap();
        assert!(repeat.is_none());
        assert_eq!(alert.cycle, 1);
        assert!(alert.reason.starts_with("cpu forecast 88.0% > 85.0%"));
        assert_eq!(alerts.try_recv().unwrap(), alert);
        assert!(alerts.try_recv().is_err());

        // Next cycle may alert again
        let next = aggregator
            .handle_outcome(outcome(entity, 2, Ok(predictions)), 200)
            .await;
        assert_eq!(next.map(|a| a.cycle), Some(2));
    }

    #[tokio::test]
    async fn test_flag_cleared_while_training_suppresses_alert() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(store);
        let id = EntityId::host("pve1");
        let snapshot = aggregator.set_critical(&id, true);
        aggregator.set_critical(&id, false);

        let result = aggregator
            .handle_outcome(outcome(snapshot, 1, Ok(vec![prediction(&id, 3600, 99.0)])), 100)
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_failed_job_raises_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(store);
        let entity = aggregator.set_critical(&EntityId::new("vm-7"), true);

        let failed = outcome(
            entity,
            1,
            Err(SentinelError::InsufficientData {
                entity_id: "vm-7".to_string(),
                available: 5,
                required: 12,
            }),
        );
        assert!(aggregator.handle_outcome(failed, 100).await.is_none());
    }

    #[tokio::test]
    async fn test_trigger_skips_entities_without_history() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(store);
        aggregator.set_critical(&EntityId::host("empty"), true);
        for i in 0..3 {
            aggregator
                .on_sample("monitor-pve1", guest_report(101, 1_700_000_000 + i * 3600, 10.0))
                .await
                .unwrap();
        }

        let report = aggregator.trigger_forecasts(1_700_100_000).await;
        assert_eq!(report.cycle, 1);
        assert_eq!(report.scheduled, 0);
        assert_eq!(aggregator.cycle(), 1);
    }

    #[tokio::test]
    async fn test_trigger_filters_by_kind_and_skips_stopped_guests() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(store);
        let t0 = 1_700_000_000;
        for i in 0..30 {
            let ts = t0 + i * 3600;
            aggregator
                .on_sample("monitor-pve1", host_report("pve1", ts, 20.0))
                .await
                .unwrap();
            aggregator
                .on_sample("monitor-pve1", guest_report(101, ts, 30.0))
                .await
                .unwrap();
            let mut stopped = guest_report(102, ts, 0.0);
            if i == 29 {
                stopped.sample.status = "stopped".to_string();
            }
            aggregator.on_sample("monitor-pve1", stopped).await.unwrap();
        }
        let now = t0 + 30 * 3600;

        let guests = aggregator
            .trigger_forecasts_for(now, Some(EntityKind::VirtualMachine))
            .await;
        assert_eq!(guests.scheduled, 1);
        assert_eq!(guests.skipped_not_running, 1);
        assert_eq!(guests.skipped_insufficient_data, 0);

        let hosts = aggregator
            .trigger_forecasts_for(now, Some(EntityKind::Host))
            .await;
        assert_eq!(hosts.cycle, 2);
        assert_eq!(hosts.scheduled, 1);
        assert_eq!(hosts.skipped_not_running, 0);

        // Back up on the next poll
        aggregator
            .on_sample("monitor-pve1", guest_report(102, now, 5.0))
            .await
            .unwrap();
        assert_eq!(
            aggregator.entities.is_running(&EntityId::guest("pve1", 102)),
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_forecast_cycle_alerts_for_hot_critical_host() {
        let store = Arc::new(InMemoryStore::new());
        let config = AggregatorConfig::default()
            .with_forecast_interval(Duration::from_millis(200))
            .with_sweep_interval(Duration::from_millis(50));
        let aggregator = Arc::new(Aggregator::new(config, store.clone()));
        let mut alerts = aggregator.subscribe_alerts();
        let id = EntityId::host("pve1");
        aggregator.set_critical(&id, true);

        // Two days of hourly samples hovering around 90% CPU
        let first_hour = (unix_now() / STEP_SECS - 48) * STEP_SECS;
        for i in 0..48 {
            let cpu = 88.0 + ((i * 37) % 11) as f64 * 0.5;
            aggregator
                .on_sample("monitor-pve1", host_report("pve1", first_hour + i * STEP_SECS, cpu))
                .await
                .unwrap();
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(aggregator.clone().run(shutdown_rx));

        let alert = tokio::time::timeout(Duration::from_secs(10), alerts.recv())
            .await
            .expect("no alert raised")
            .unwrap();
        assert_eq!(alert.entity_id, id);
        assert!(alert.cycle >= 1);

        let predictions = aggregator.predictions_for(&id).await.unwrap();
        assert_eq!(predictions.len(), 48);
        assert!(predictions.iter().all(|p| p.is_anomaly));

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
