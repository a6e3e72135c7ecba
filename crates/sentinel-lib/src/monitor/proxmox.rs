//! Proxmox VE implementation of [`HypervisorApi`]
//!
//! Uses ticket authentication against `/api2/json/access/ticket` and the
//! node, QEMU and LXC status endpoints.

use super::{GuestKind, GuestSummary, HypervisorApi, HypervisorStatus};
use crate::error::{Result, SentinelError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Default Proxmox API port
pub const DEFAULT_PORT: u16 = 8006;

/// Realm appended to bare user names
const DEFAULT_REALM: &str = "@pam";

/// Connection settings for one Proxmox endpoint
#[derive(Debug, Clone)]
pub struct ProxmoxConfig {
    /// Host name or base URL (`pve1.lan`, `https://10.0.0.5:8006`)
    pub url: String,
    pub user: String,
    pub password: String,
    /// Accept self-signed certificates (the Proxmox default install)
    pub verify_tls: bool,
    pub timeout: Duration,
}

impl ProxmoxConfig {
    pub fn new(url: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: user.into(),
            password: password.into(),
            verify_tls: false,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Base URL with scheme and port filled in
    pub fn base_url(&self) -> String {
        let trimmed = self.url.trim_end_matches('/');
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{}", trimmed)
        };
        let authority = with_scheme.split("://").nth(1).unwrap_or_default();
        if authority.contains(':') {
            with_scheme
        } else {
            format!("{}:{}", with_scheme, DEFAULT_PORT)
        }
    }

    /// User name qualified with a realm
    pub fn username(&self) -> String {
        if self.user.contains('@') {
            self.user.clone()
        } else {
            format!("{}{}", self.user, DEFAULT_REALM)
        }
    }
}

/// Proxmox REST client
pub struct ProxmoxClient {
    client: Client,
    config: ProxmoxConfig,
    base_url: String,
    ticket: RwLock<Option<String>>,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct TicketData {
    ticket: String,
}

#[derive(Debug, Default, Deserialize)]
struct UsageField {
    #[serde(default)]
    used: Option<u64>,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatusData {
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    memory: UsageField,
    #[serde(default)]
    rootfs: UsageField,
    #[serde(default)]
    uptime: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct GuestData {
    #[serde(deserialize_with = "lenient_u32")]
    vmid: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    mem: Option<u64>,
    #[serde(default)]
    maxmem: Option<u64>,
    #[serde(default)]
    disk: Option<u64>,
    #[serde(default)]
    maxdisk: Option<u64>,
    #[serde(default)]
    netin: Option<u64>,
    #[serde(default)]
    netout: Option<u64>,
    #[serde(default)]
    uptime: Option<u64>,
}

/// LXC listings report `vmid` as a string, QEMU as a number
fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u32),
        Str(String),
    }
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

impl From<NodeStatusData> for HypervisorStatus {
    fn from(d: NodeStatusData) -> Self {
        Self {
            cpu_ratio: d.cpu.unwrap_or(0.0),
            mem_used: d.memory.used.unwrap_or(0),
            mem_total: d.memory.total.unwrap_or(0),
            disk_used: d.rootfs.used.unwrap_or(0),
            disk_total: d.rootfs.total.unwrap_or(0),
            net_in: 0,
            net_out: 0,
            uptime: d.uptime.unwrap_or(0),
            status: "online".to_string(),
        }
    }
}

impl From<GuestData> for HypervisorStatus {
    fn from(d: GuestData) -> Self {
        Self {
            cpu_ratio: d.cpu.unwrap_or(0.0),
            mem_used: d.mem.unwrap_or(0),
            mem_total: d.maxmem.unwrap_or(0),
            disk_used: d.disk.unwrap_or(0),
            disk_total: d.maxdisk.unwrap_or(0),
            net_in: d.netin.unwrap_or(0),
            net_out: d.netout.unwrap_or(0),
            uptime: d.uptime.unwrap_or(0),
            status: d.status.unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

impl ProxmoxClient {
    pub fn new(config: ProxmoxConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| SentinelError::TransientNetwork(format!("build HTTP client: {}", e)))?;
        let base_url = config.base_url();

        Ok(Self {
            client,
            config,
            base_url,
            ticket: RwLock::new(None),
        })
    }

    async fn login(&self) -> Result<String> {
        let username = self.config.username();
        let response = self
            .client
            .post(format!("{}/api2/json/access/ticket", self.base_url))
            .form(&[
                ("username", username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(SentinelError::Auth {
                identity: username,
                reason: format!("Proxmox rejected login ({})", response.status()),
            });
        }

        let body: ApiResponse<TicketData> = response.error_for_status()?.json().await?;
        info!(url = %self.base_url, user = %username, "Authenticated with Proxmox");
        Ok(body.data.ticket)
    }

    async fn ticket(&self) -> Result<String> {
        if let Some(ticket) = self.ticket.read().await.clone() {
            return Ok(ticket);
        }
        let ticket = self.login().await?;
        *self.ticket.write().await = Some(ticket.clone());
        Ok(ticket)
    }

    /// GET `path`, logging in again once if the ticket has expired
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        for attempt in 0..2 {
            let ticket = self.ticket().await?;
            let response = self
                .client
                .get(format!("{}/api2/json{}", self.base_url, path))
                .header("Cookie", format!("PVEAuthCookie={}", ticket))
                .send()
                .await?;

            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!(path = %path, "Proxmox ticket expired, re-authenticating");
                *self.ticket.write().await = None;
                continue;
            }

            let body: ApiResponse<T> = response.error_for_status()?.json().await?;
            return Ok(body.data);
        }

        Err(SentinelError::Auth {
            identity: self.config.username(),
            reason: format!("Proxmox refused {} after re-authentication", path),
        })
    }
}

#[async_trait]
impl HypervisorApi for ProxmoxClient {
    async fn node_status(&self, node: &str) -> Result<HypervisorStatus> {
        let data: NodeStatusData = self.get(&format!("/nodes/{}/status", node)).await?;
        Ok(data.into())
    }

    async fn list_guests(&self, node: &str) -> Result<Vec<GuestSummary>> {
        let mut listings = Vec::with_capacity(2);
        for kind in [GuestKind::Qemu, GuestKind::Lxc] {
            let listed = self
                .get::<Vec<GuestData>>(&format!("/nodes/{}/{}", node, kind.as_str()))
                .await;
            listings.push((kind, listed));
        }
        merge_listings(node, listings)
    }

    async fn guest_status(&self, node: &str, guest: &GuestSummary) -> Result<HypervisorStatus> {
        let data: GuestData = self
            .get(&format!(
                "/nodes/{}/{}/{}/status/current",
                node,
                guest.kind.as_str(),
                guest.vmid
            ))
            .await?;
        Ok(data.into())
    }
}

/// Combine the per-kind guest listings of `node`.
///
/// A failing listing is logged and skipped so the other kind is still
/// polled; the call fails only when every listing failed.
fn merge_listings(
    node: &str,
    listings: Vec<(GuestKind, Result<Vec<GuestData>>)>,
) -> Result<Vec<GuestSummary>> {
    let mut guests = Vec::new();
    let mut last_error = None;
    let mut listed_any = false;

    for (kind, listed) in listings {
        match listed {
            Ok(listed) => {
                listed_any = true;
                guests.extend(listed.into_iter().map(|g| summary(g, kind)));
            }
            Err(e) => {
                warn!(
                    node = %node,
                    kind = kind.as_str(),
                    error = %e,
                    "Failed to list guests, keeping the other kind"
                );
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) if !listed_any => Err(e),
        _ => {
            guests.sort_by_key(|g| g.vmid);
            Ok(guests)
        }
    }
}

fn summary(data: GuestData, kind: GuestKind) -> GuestSummary {
    GuestSummary {
        vmid: data.vmid,
        name: data.name.unwrap_or_default(),
        kind,
        status: data.status.unwrap_or_else(|| "unknown".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_defaults() {
        let cfg = ProxmoxConfig::new("pve1.lan", "root", "pw");
        assert_eq!(cfg.base_url(), "https://pve1.lan:8006");

        let cfg = ProxmoxConfig::new("http://10.0.0.5:9000/", "root", "pw");
        assert_eq!(cfg.base_url(), "http://10.0.0.5:9000");
    }

    #[test]
    fn test_username_realm() {
        assert_eq!(ProxmoxConfig::new("h", "root", "").username(), "root@pam");
        assert_eq!(
            ProxmoxConfig::new("h", "ops@pve", "").username(),
            "ops@pve"
        );
    }

    #[test]
    fn test_node_status_parsing() {
        let json = r#"{"data":{"cpu":0.25,"memory":{"used":4096,"total":8192},
            "rootfs":{"used":10,"total":100},"uptime":3600}}"#;
        let parsed: ApiResponse<NodeStatusData> = serde_json::from_str(json).unwrap();
        let status = HypervisorStatus::from(parsed.data);

        assert_eq!(status.cpu_pct(), 25.0);
        assert_eq!(status.mem_pct(), 50.0);
        assert_eq!(status.disk_used, 10);
        assert_eq!(status.uptime, 3600);
    }

    #[test]
    fn test_guest_listing_accepts_string_vmid_and_missing_fields() {
        let json = r#"{"data":[
            {"vmid":101,"name":"web","status":"running","cpu":0.5,"mem":512,"maxmem":1024},
            {"vmid":"202","status":"stopped"}
        ]}"#;
        let parsed: ApiResponse<Vec<GuestData>> = serde_json::from_str(json).unwrap();
        let mut rows = parsed.data.into_iter();

        let web = rows.next().unwrap();
        assert_eq!(web.vmid, 101);
        let web_status = HypervisorStatus::from(web);
        assert_eq!(web_status.cpu_pct(), 50.0);
        assert_eq!(web_status.mem_pct(), 50.0);

        let ct = summary(rows.next().unwrap(), GuestKind::Lxc);
        assert_eq!(ct.vmid, 202);
        assert_eq!(ct.name, "");
        assert_eq!(ct.status, "stopped");
    }

    #[test]
    fn test_failed_listing_keeps_other_kind() {
        let guest = |vmid: u32| GuestData {
            vmid,
            status: Some("running".to_string()),
            ..Default::default()
        };
        let down = || -> Result<Vec<GuestData>> {
            Err(SentinelError::TransientNetwork("listing timed out".into()))
        };

        let guests = merge_listings(
            "pve1",
            vec![(GuestKind::Qemu, Ok(vec![guest(300), guest(101)])), (GuestKind::Lxc, down())],
        )
        .unwrap();
        let vmids: Vec<u32> = guests.iter().map(|g| g.vmid).collect();
        assert_eq!(vmids, vec![101, 300]);
        assert!(guests.iter().all(|g| g.kind == GuestKind::Qemu));

        let guests = merge_listings(
            "pve1",
            vec![(GuestKind::Qemu, down()), (GuestKind::Lxc, Ok(vec![guest(200)]))],
        )
        .unwrap();
        assert_eq!(guests[0].kind, GuestKind::Lxc);

        // An empty node is not an error
        assert!(merge_listings("pve1", vec![(GuestKind::Qemu, Ok(vec![]))])
            .unwrap()
            .is_empty());

        let err = merge_listings("pve1", vec![(GuestKind::Qemu, down()), (GuestKind::Lxc, down())])
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_stopped_guest_without_memory_reports_zero() {
        let status = HypervisorStatus::from(GuestData {
            vmid: 7,
            ..Default::default()
        });
        assert_eq!(status.mem_pct(), 0.0);
        assert_eq!(status.cpu_pct(), 0.0);
        assert_eq!(status.status, "unknown");
    }
}
