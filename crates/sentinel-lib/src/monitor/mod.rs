//! Per-host monitor agent
//!
//! This module provides:
//! - The [`HypervisorApi`] boundary and a Proxmox implementation
//! - [`ConnectionRegistry`], the explicit map of node → API client
//! - [`Target`], the host/guest variant every poll is expressed over
//! - The pure connection state machine in [`state`]
//! - [`MonitorAgent`], the poll loop publishing samples and heartbeats

mod agent;
mod proxmox;
pub mod state;


pub use agent::{MonitorAgent, MonitorConfig, TickReport};
pub use proxmox::{ProxmoxClient, ProxmoxConfig};
pub use state::{Effect, MonitorEvent, MonitorState};

use crate::error::Result;
use crate::models::{EntityId, EntityKind, MetricSample, SampleReport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Raw status of a node or guest as reported by the hypervisor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HypervisorStatus {
    /// CPU utilisation as a fraction of allotted cores (0.0 - 1.0)
    pub cpu_ratio: f64,
    pub mem_used: u64,
    pub mem_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub net_in: u64,
    pub net_out: u64,
    pub uptime: u64,
    pub status: String,
}

impl HypervisorStatus {
    pub fn cpu_pct(&self) -> f64 {
        if self.cpu_ratio.is_finite() {
            (self.cpu_ratio * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        }
    }

    pub fn mem_pct(&self) -> f64 {
        if self.mem_total == 0 {
            return 0.0;
        }
        (self.mem_used as f64 / self.mem_total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Guest flavour on a Proxmox node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    Qemu,
    Lxc,
}

impl GuestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestKind::Qemu => "qemu",
            GuestKind::Lxc => "lxc",
        }
    }
}

/// Guest listed on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestSummary {
    pub vmid: u32,
    pub name: String,
    pub kind: GuestKind,
    pub status: String,
}

/// Hypervisor control-plane boundary
#[async_trait]
pub trait HypervisorApi: Send + Sync {
    /// Status of the node itself
    async fn node_status(&self, node: &str) -> Result<HypervisorStatus>;

    /// VMs and containers hosted on the node
    async fn list_guests(&self, node: &str) -> Result<Vec<GuestSummary>>;

    /// Current status of one guest
    async fn guest_status(&self, node: &str, guest: &GuestSummary) -> Result<HypervisorStatus>;
}

/// Something a monitor polls once per tick
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Host { node: String },
    Guest { node: String, guest: GuestSummary },
}

impl Target {
    pub fn id(&self) -> EntityId {
        match self {
            Target::Host { node } => EntityId::host(node),
            Target::Guest { node, guest } => EntityId::guest(node, guest.vmid),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Target::Host { .. } => EntityKind::Host,
            Target::Guest { .. } => EntityKind::VirtualMachine,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Target::Host { node } => node.clone(),
            Target::Guest { guest, .. } if !guest.name.is_empty() => guest.name.clone(),
            Target::Guest { guest, .. } => format!("VM-{}", guest.vmid),
        }
    }

    /// Fetch the current status from the hypervisor
    pub async fn poll(&self, api: &dyn HypervisorApi) -> Result<HypervisorStatus> {
        match self {
            Target::Host { node } => api.node_status(node).await,
            Target::Guest { node, guest } => api.guest_status(node, guest).await,
        }
    }

    /// Build the published sample for a status observed at `timestamp`
    pub fn sample_fields(&self, status: &HypervisorStatus, timestamp: i64) -> SampleReport {
        let (node, vmid) = match self {
            Target::Host { node } => (node.clone(), None),
            Target::Guest { node, guest } => (node.clone(), Some(guest.vmid)),
        };
        SampleReport {
            sample: MetricSample {
                entity_id: self.id(),
                timestamp,
                cpu_pct: status.cpu_pct(),
                mem_pct: status.mem_pct(),
                disk_used: status.disk_used,
                net_in: status.net_in,
                net_out: status.net_out,
                status: status.status.clone(),
            },
            node,
            vmid,
            display_name: self.display_name(),
        }
    }
}

/// Explicit node → hypervisor client map, built once at start and passed
/// to whatever needs a client.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    clients: Arc<RwLock<HashMap<String, Arc<dyn HypervisorApi>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the client used for `node`
    pub fn register(&self, node: impl Into<String>, client: Arc<dyn HypervisorApi>) {
        if let Ok(mut clients) = self.clients.write() {
            clients.insert(node.into(), client);
        }
    }

    pub fn get(&self, node: &str) -> Option<Arc<dyn HypervisorApi>> {
        self.clients.read().ok()?.get(node).cloned()
    }

    pub fn remove(&self, node: &str) -> bool {
        self.clients
            .write()
            .map(|mut c| c.remove(node).is_some())
            .unwrap_or(false)
    }

    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .clients
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        nodes.sort();
        nodes
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("nodes", &self.nodes())
            .finish()
    }
}
