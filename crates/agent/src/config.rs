//! Agent configuration
//!
//! Read from an optional TOML file (path in `SENTINEL_CONFIG`) overlaid by
//! `SENTINEL_*` environment variables; nested keys use `__`, e.g.
//! `SENTINEL_HYPERVISOR__URL`.

use anyhow::{bail, Context, Result};
use sentinel_lib::aggregator::{AggregatorConfig, LivenessConfig};
use sentinel_lib::anomaly::AnomalyPolicy;
use sentinel_lib::forecast::{default_pool_size, ForecastConfig, SchedulerConfig};
use sentinel_lib::monitor::{MonitorConfig, ProxmoxConfig};
use sentinel_lib::store::StoreConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

const DAY_SECS: u64 = 24 * 3600;

/// Which half of the mesh this process runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Monitor,
    Cerebro,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Monitor => "monitor",
            Role::Cerebro => "cerebro",
        }
    }
}

/// Proxmox connection settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HypervisorSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_hypervisor_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub verify_tls: bool,
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub role: Role,

    /// Transport identity; defaults per role
    #[serde(default)]
    pub agent_id: Option<String>,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Broker address; cerebro listens here, monitors connect here
    #[serde(default = "default_broker_addr")]
    pub broker_addr: String,

    #[serde(default = "default_aggregator_id")]
    pub aggregator_id: String,

    /// Shared secret presented on connect
    #[serde(default)]
    pub secret: String,

    /// Identity → secret table accepted by the broker (cerebro only)
    #[serde(default)]
    pub credentials: HashMap<String, String>,

    /// Hypervisor node watched by a monitor
    #[serde(default = "default_node_name")]
    pub node_name: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    #[serde(default)]
    pub hypervisor: HypervisorSettings,

    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,

    #[serde(default = "default_offline_timeout")]
    pub offline_timeout_secs: u64,

    #[serde(default = "default_forecast_interval")]
    pub forecast_interval_secs: u64,

    #[serde(default = "default_horizon_hours")]
    pub horizon_hours: usize,

    /// Training workers; defaults to min(cores, 8)
    #[serde(default)]
    pub pool_size: Option<usize>,

    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    #[serde(default = "default_host_window_days")]
    pub host_window_days: u64,

    #[serde(default = "default_vm_window_days")]
    pub vm_window_days: u64,

    #[serde(default = "default_host_min_points")]
    pub host_min_points: usize,

    #[serde(default = "default_vm_min_points")]
    pub vm_min_points: usize,

    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,

    #[serde(default = "default_mem_threshold")]
    pub mem_threshold: f64,

    #[serde(default)]
    pub alert_suppression_cycles: u64,

    /// JSON snapshot file; in-memory only when unset
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Samples and predictions older than this are pruned; 0 keeps all
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_hypervisor_user() -> String {
    "root@pam".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_broker_addr() -> String {
    "127.0.0.1:5222".to_string()
}

fn default_aggregator_id() -> String {
    "cerebro".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_call_timeout() -> u64 {
    10
}

fn default_stale_timeout() -> u64 {
    90
}

fn default_offline_timeout() -> u64 {
    300
}

fn default_forecast_interval() -> u64 {
    3600
}

fn default_horizon_hours() -> usize {
    48
}

fn default_job_timeout() -> u64 {
    120
}

fn default_host_window_days() -> u64 {
    30
}

fn default_vm_window_days() -> u64 {
    14
}

fn default_host_min_points() -> usize {
    24
}

fn default_vm_min_points() -> usize {
    12
}

fn default_cpu_threshold() -> f64 {
    85.0
}

fn default_mem_threshold() -> f64 {
    90.0
}

fn default_flush_interval() -> u64 {
    60
}

fn default_retention_days() -> u64 {
    35
}

impl AgentConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("SENTINEL_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("SENTINEL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml(document: &str) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(document, config::FileFormat::Toml))
            .build()
            .context("failed to parse configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.offline_timeout_secs <= self.stale_timeout_secs {
            bail!(
                "offline_timeout_secs ({}) must exceed stale_timeout_secs ({})",
                self.offline_timeout_secs,
                self.stale_timeout_secs
            );
        }
        if self.role == Role::Monitor && self.hypervisor.url.is_empty() {
            bail!("monitor role requires hypervisor.url");
        }
        for (name, value) in [
            ("poll_interval_secs", self.poll_interval_secs),
            ("forecast_interval_secs", self.forecast_interval_secs),
            ("call_timeout_secs", self.call_timeout_secs),
            ("job_timeout_secs", self.job_timeout_secs),
            ("horizon_hours", self.horizon_hours as u64),
        ] {
            if value == 0 {
                bail!("{} must be positive", name);
            }
        }
        let widest_window = self.host_window_days.max(self.vm_window_days);
        if self.retention_days != 0 && self.retention_days < widest_window {
            bail!(
                "retention_days ({}) must cover the training windows ({} days)",
                self.retention_days,
                widest_window
            );
        }
        Ok(())
    }

    /// Transport identity, defaulting to `monitor-<node>` or `cerebro`
    pub fn agent_id(&self) -> String {
        match (&self.agent_id, self.role) {
            (Some(id), _) => id.clone(),
            (None, Role::Monitor) => format!("monitor-{}", self.node_name),
            (None, Role::Cerebro) => self.aggregator_id.clone(),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig::new(&self.node_name)
            .with_agent_id(self.agent_id())
            .with_aggregator_id(&self.aggregator_id)
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_call_timeout(Duration::from_secs(self.call_timeout_secs))
    }

    pub fn proxmox_config(&self) -> ProxmoxConfig {
        let h = &self.hypervisor;
        ProxmoxConfig::new(&h.url, &h.user, &h.password)
            .with_verify_tls(h.verify_tls)
            .with_timeout(Duration::from_secs(self.call_timeout_secs))
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        let forecast = ForecastConfig::default()
            .with_horizon(self.horizon_hours)
            .with_windows(
                Duration::from_secs(self.host_window_days * DAY_SECS),
                Duration::from_secs(self.vm_window_days * DAY_SECS),
            )
            .with_min_points(self.host_min_points, self.vm_min_points);
        let scheduler = SchedulerConfig::default()
            .with_pool_size(self.pool_size.unwrap_or_else(default_pool_size))
            .with_job_timeout(Duration::from_secs(self.job_timeout_secs));

        AggregatorConfig::default()
            .with_identity(self.agent_id())
            .with_forecast_interval(Duration::from_secs(self.forecast_interval_secs))
            .with_liveness(LivenessConfig {
                stale_timeout: Duration::from_secs(self.stale_timeout_secs),
                offline_timeout: Duration::from_secs(self.offline_timeout_secs),
            })
            .with_forecast(forecast)
            .with_scheduler(scheduler)
            .with_policy(AnomalyPolicy::new(self.cpu_threshold, self.mem_threshold))
            .with_alert_suppression(self.alert_suppression_cycles)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            persistence_path: self.store_path.clone(),
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            retention: (self.retention_days > 0)
                .then(|| Duration::from_secs(self.retention_days * DAY_SECS)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cerebro_defaults() {
        let config = AgentConfig::from_toml(r#"role = "cerebro""#).unwrap();

        assert_eq!(config.role, Role::Cerebro);
        assert_eq!(config.agent_id(), "cerebro");
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.broker_addr, "127.0.0.1:5222");

        let aggregator = config.aggregator_config();
        assert_eq!(aggregator.forecast_interval, Duration::from_secs(3600));
        assert_eq!(aggregator.liveness.stale_timeout, Duration::from_secs(90));
        assert_eq!(aggregator.liveness.offline_timeout, Duration::from_secs(300));
        assert_eq!(aggregator.forecast.horizon_hours, 48);
        assert_eq!(aggregator.forecast.host_window, Duration::from_secs(30 * DAY_SECS));
        assert_eq!(aggregator.scheduler.pool_size, default_pool_size());
        assert_eq!(aggregator.policy, AnomalyPolicy::new(85.0, 90.0));
        assert_eq!(aggregator.alert_suppression_cycles, 0);
        assert!(config.store_config().persistence_path.is_none());
        assert_eq!(
            config.store_config().retention,
            Some(Duration::from_secs(35 * DAY_SECS))
        );
    }

    #[test]
    fn test_monitor_settings() {
        let config = AgentConfig::from_toml(
            r#"
            node_name = "pve2"
            secret = "s3cret"
            poll_interval_secs = 45

            [hypervisor]
            url = "10.0.0.2"
            user = "monitor"
            password = "pw"
            "#,
        )
        .unwrap();

        assert_eq!(config.role, Role::Monitor);
        assert_eq!(config.agent_id(), "monitor-pve2");

        let monitor = config.monitor_config();
        assert_eq!(monitor.node, "pve2");
        assert_eq!(monitor.poll_interval, Duration::from_secs(45));
        assert_eq!(monitor.aggregator_id, "cerebro");

        let proxmox = config.proxmox_config();
        assert_eq!(proxmox.base_url(), "https://10.0.0.2:8006");
        assert_eq!(proxmox.username(), "monitor@pam");
        assert!(!proxmox.verify_tls);
    }

    #[test]
    fn test_credentials_table() {
        let config = AgentConfig::from_toml(
            r#"
            role = "cerebro"
            pool_size = 3
            store_path = "/var/lib/sentinel/store.json"

            [credentials]
            "monitor-pve1" = "a"
            "monitor-pve2" = "b"
            "#,
        )
        .unwrap();

        assert_eq!(config.credentials.len(), 2);
        assert_eq!(config.credentials["monitor-pve2"], "b");
        assert_eq!(config.aggregator_config().scheduler.pool_size, 3);
        assert_eq!(
            config.store_config().persistence_path,
            Some(PathBuf::from("/var/lib/sentinel/store.json"))
        );
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(AgentConfig::from_toml(r#"role = "monitor""#).is_err());
        assert!(AgentConfig::from_toml(
            r#"
            role = "cerebro"
            stale_timeout_secs = 300
            offline_timeout_secs = 120
            "#
        )
        .is_err());
        assert!(AgentConfig::from_toml(r#"role = "watchdog""#).is_err());
    }

    #[test]
    fn test_zero_durations_rejected() {
        for setting in [
            "horizon_hours = 0",
            "call_timeout_secs = 0",
            "poll_interval_secs = 0",
            "forecast_interval_secs = 0",
            "job_timeout_secs = 0",
        ] {
            let document = format!("role = \"cerebro\"\n{}", setting);
            let err = AgentConfig::from_toml(&document).unwrap_err();
            assert!(
                err.to_string().contains("must be positive"),
                "{} accepted: {}",
                setting,
                err
            );
        }
    }

    #[test]
    fn test_retention_settings() {
        let config = AgentConfig::from_toml(
            r#"
            role = "cerebro"
            retention_days = 0
            "#,
        )
        .unwrap();
        assert!(config.store_config().retention.is_none());

        // Shorter than the 30 day host window
        assert!(AgentConfig::from_toml(
            r#"
            role = "cerebro"
            retention_days = 7
            "#
        )
        .is_err());
    }
}
