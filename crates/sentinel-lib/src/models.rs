//! Core data models shared by the monitor, aggregator and forecaster

use crate::error::{Result, SentinelError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Kind of monitored unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Host,
    VirtualMachine,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Host => "host",
            EntityKind::VirtualMachine => "virtual_machine",
        }
    }

    /// Parse a kind filter; guests are also accepted as `vm`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" | "node" => Some(EntityKind::Host),
            "vm" | "guest" | "virtual_machine" => Some(EntityKind::VirtualMachine),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable key of a monitored entity.
///
/// Hosts are keyed by node name, guests by `"<node>/<vmid>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn host(node: &str) -> Self {
        Self(node.to_string())
    }

    pub fn guest(node: &str, vmid: u32) -> Self {
        Self(format!("{}/{}", node, vmid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A monitored host or guest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub display_name: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub critical: bool,
}

impl Entity {
    pub fn new(id: EntityId, display_name: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            kind,
            critical: false,
        }
    }
}

/// One utilization observation for an entity.
///
/// Keyed by `(entity_id, timestamp)`; a second write for the same key
/// replaces the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub entity_id: EntityId,
    /// Unix seconds
    pub timestamp: i64,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub disk_used: u64,
    pub net_in: u64,
    pub net_out: u64,
    pub status: String,
}

impl MetricSample {
    /// Guest running or node online, as reported by the hypervisor
    pub fn is_running(&self) -> bool {
        matches!(self.status.as_str(), "running" | "online")
    }

    /// Check the sample is well formed before it reaches the store
    pub fn validate(&self) -> Result<()> {
        if self.entity_id.as_str().trim().is_empty() {
            return Err(SentinelError::validation("empty entity_id"));
        }
        if self.timestamp <= 0 {
            return Err(SentinelError::validation(format!(
                "non-positive timestamp {} for {}",
                self.timestamp, self.entity_id
            )));
        }
        for (name, value) in [("cpu_pct", self.cpu_pct), ("mem_pct", self.mem_pct)] {
            if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                return Err(SentinelError::validation(format!(
                    "{} out of range for {}: {}",
                    name, self.entity_id, value
                )));
            }
        }
        Ok(())
    }
}

/// Sample as published by a monitor, carrying the shape the aggregator
/// uses to auto-register unknown entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleReport {
    pub sample: MetricSample,
    pub node: String,
    pub vmid: Option<u32>,
    pub display_name: String,
}

impl SampleReport {
    /// Entity kind inferred from the message shape
    pub fn inferred_kind(&self) -> EntityKind {
        if self.vmid.is_some() {
            EntityKind::VirtualMachine
        } else {
            EntityKind::Host
        }
    }
}

/// Liveness signal published by every monitor on each tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: String,
    pub node: String,
    pub timestamp: i64,
    /// False when the hypervisor API failed for the whole tick
    pub hypervisor_ok: bool,
    pub entity_ids: Vec<EntityId>,
}

/// Forecast for one entity at one future hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub entity_id: EntityId,
    pub generated_at: i64,
    pub forecast_timestamp: i64,
    pub predicted_cpu: f64,
    pub predicted_mem: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
    pub is_anomaly: bool,
}

/// Liveness state of a monitor agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Stale,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Stale => "stale",
            AgentStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregator-side record of a monitor agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub entity_ids: BTreeSet<EntityId>,
    pub last_seen: i64,
    pub status: AgentStatus,
    /// Whether the last heartbeat reported a working hypervisor API
    pub hypervisor_ok: bool,
}

/// Signal for the watchdog when a critical entity is forecast to breach
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalAlert {
    pub entity_id: EntityId,
    pub reason: String,
    pub cycle: u64,
    pub raised_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f64, mem: f64) -> MetricSample {
        MetricSample {
            entity_id: EntityId::host("pve1"),
            timestamp: 1_700_000_000,
            cpu_pct: cpu,
            mem_pct: mem,
            disk_used: 0,
            net_in: 0,
            net_out: 0,
            status: "online".to_string(),
        }
    }

    #[test]
    fn test_entity_id_formats() {
        assert_eq!(EntityId::host("pve1").as_str(), "pve1");
        assert_eq!(EntityId::guest("pve1", 101).as_str(), "pve1/101");
    }

    #[test]
    fn test_sample_validation() {
        assert!(sample(40.0, 50.0).validate().is_ok());
        assert!(sample(100.0, 0.0).validate().is_ok());
        assert!(sample(-1.0, 50.0).validate().is_err());
        assert!(sample(40.0, 100.5).validate().is_err());
        assert!(sample(f64::NAN, 50.0).validate().is_err());

        let mut bad = sample(10.0, 10.0);
        bad.timestamp = 0;
        assert!(bad.validate().is_err());

        let mut unnamed = sample(10.0, 10.0);
        unnamed.entity_id = EntityId::new("  ");
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn test_kind_inferred_from_shape() {
        let mut report = SampleReport {
            sample: sample(1.0, 1.0),
            node: "pve1".to_string(),
            vmid: None,
            display_name: "pve1".to_string(),
        };
        assert_eq!(report.inferred_kind(), EntityKind::Host);
        report.vmid = Some(101);
        assert_eq!(report.inferred_kind(), EntityKind::VirtualMachine);
    }

    #[test]
    fn test_running_status_and_kind_filter() {
        assert!(sample(1.0, 1.0).is_running());
        let mut stopped = sample(1.0, 1.0);
        stopped.status = "stopped".to_string();
        assert!(!stopped.is_running());

        assert_eq!(EntityKind::parse("host"), Some(EntityKind::Host));
        assert_eq!(EntityKind::parse("VM"), Some(EntityKind::VirtualMachine));
        assert_eq!(EntityKind::parse("container"), None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&AgentStatus::Stale).unwrap();
        assert_eq!(json, "\"stale\"");
    }
}
