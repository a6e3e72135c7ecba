//! Monitor agent liveness tracking
//!
//! Agents are `online` while heartbeats or samples keep arriving, `stale`
//! once nothing has been heard for `stale_timeout`, and `offline` after
//! `offline_timeout`. Any later heartbeat brings them back online.

use crate::models::{AgentRegistration, AgentStatus, EntityId, Heartbeat};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Liveness thresholds
#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    /// Silence before an agent is stale (default: 90 seconds)
    pub stale_timeout: Duration,
    /// Silence before an agent is offline (default: 300 seconds)
    pub offline_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(90),
            offline_timeout: Duration::from_secs(300),
        }
    }
}

/// One liveness change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub agent_id: String,
    pub from: AgentStatus,
    pub to: AgentStatus,
}

/// Registrations keyed by agent identity
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    config: LivenessConfig,
    agents: Arc<Mutex<BTreeMap<String, AgentRegistration>>>,
}

impl AgentRegistry {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            agents: Arc::default(),
        }
    }

    /// Record a heartbeat received at `now`
    pub fn on_heartbeat(&self, agent_id: &str, heartbeat: &Heartbeat, now: i64) -> Option<StatusChange> {
        self.touch(agent_id, now, |reg| {
            reg.hypervisor_ok = heartbeat.hypervisor_ok;
            if !heartbeat.entity_ids.is_empty() {
                reg.entity_ids = heartbeat.entity_ids.iter().cloned().collect();
            }
        })
    }

    /// Record a sample received at `now`
    pub fn on_sample(&self, agent_id: &str, entity_id: &EntityId, now: i64) -> Option<StatusChange> {
        self.touch(agent_id, now, |reg| {
            reg.entity_ids.insert(entity_id.clone());
        })
    }

    /// The broker reported the agent's link down. Known online agents go
    /// stale right away; the sweep decides when they are offline.
    pub fn on_link_down(&self, agent_id: &str) -> Option<StatusChange> {
        let mut agents = self.agents.lock().ok()?;
        let reg = agents.get_mut(agent_id)?;
        if reg.status != AgentStatus::Online {
            return None;
        }
        reg.status = AgentStatus::Stale;
        Some(StatusChange {
            agent_id: agent_id.to_string(),
            from: AgentStatus::Online,
            to: AgentStatus::Stale,
        })
    }

    /// Apply the timeouts at `now`
    pub fn sweep(&self, now: i64) -> Vec<StatusChange> {
        let Ok(mut agents) = self.agents.lock() else {
            return Vec::new();
        };
        let stale_after = self.config.stale_timeout.as_secs() as i64;
        let offline_after = self.config.offline_timeout.as_secs() as i64;

        let mut changes = Vec::new();
        for reg in agents.values_mut() {
            let silent = now - reg.last_seen;
            let next = if silent > offline_after {
                AgentStatus::Offline
            } else if silent > stale_after {
                AgentStatus::Stale
            } else {
                reg.status
            };
            // Sweeping never upgrades, only a message does
            if severity(next) > severity(reg.status) {
                changes.push(StatusChange {
                    agent_id: reg.agent_id.clone(),
                    from: reg.status,
                    to: next,
                });
                reg.status = next;
            }
        }
        changes
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.agents.lock().ok()?.get(agent_id).cloned()
    }

    pub fn list(&self) -> Vec<AgentRegistration> {
        self.agents
            .lock()
            .map(|a| a.values().cloned().collect())
            .unwrap_or_default()
    }

    /// (online, stale, offline)
    pub fn counts(&self) -> (i64, i64, i64) {
        self.list()
            .iter()
            .fold((0, 0, 0), |(on, st, off), reg| match reg.status {
                AgentStatus::Online => (on + 1, st, off),
                AgentStatus::Stale => (on, st + 1, off),
                AgentStatus::Offline => (on, st, off + 1),
            })
    }

    fn touch(
        &self,
        agent_id: &str,
        now: i64,
        update: impl FnOnce(&mut AgentRegistration),
    ) -> Option<StatusChange> {
        let mut agents = self.agents.lock().ok()?;
        let reg = agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentRegistration {
                agent_id: agent_id.to_string(),
                entity_ids: Default::default(),
                last_seen: now,
                status: AgentStatus::Online,
                hypervisor_ok: true,
            });

        reg.last_seen = reg.last_seen.max(now);
        update(reg);

        let from = reg.status;
        reg.status = AgentStatus::Online;
        (from != AgentStatus::Online).then(|| StatusChange {
            agent_id: agent_id.to_string(),
            from,
            to: AgentStatus::Online,
        })
    }
}

fn severity(status: AgentStatus) -> u8 {
    match status {
        AgentStatus::Online => 0,
        AgentStatus::Stale => 1,
        AgentStatus::Offline => 2,
    }
}
