//! Hypervisor management API (Proxmox VE flavoured).
//!
//! Power primitives return a task ID (UPID) that can be awaited with
//! `wait_for_task`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::HypervisorConfig;
use crate::domain::node::{ApiToken, HostApi};
use crate::domain::types::PowerState;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskId(pub String);

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GuestSummary {
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GuestStatus {
    pub status: String,
    #[serde(default)]
    pub qmpstatus: Option<String>,
}

impl GuestStatus {
    /// `qmpstatus` distinguishes a paused guest from a running one.
    pub fn power_state(&self) -> PowerState {
        match (self.status.as_str(), self.qmpstatus.as_deref()) {
            ("running", Some("paused")) | ("running", Some("suspended")) => PowerState::Suspended,
            ("running", _) => PowerState::On,
            ("paused", _) | ("suspended", _) => PowerState::Suspended,
            ("stopped", _) => PowerState::Off,
            _ => PowerState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestCommand {
    Start,
    Stop,
    Shutdown,
    Pause,
    Resume,
}

impl GuestCommand {
    fn endpoint(self) -> &'static str {
        match self {
            GuestCommand::Start => "start",
            GuestCommand::Stop => "stop",
            GuestCommand::Shutdown => "shutdown",
            GuestCommand::Pause => "suspend",
            GuestCommand::Resume => "resume",
        }
    }
}

#[async_trait]
pub trait HypervisorApi: Send + Sync {
    /// Returns `Cancelled` without touching the network if `cancel` has fired.
    async fn list_guests(&self, cancel: &CancellationToken) -> EngineResult<Vec<GuestSummary>>;

    async fn guest_status(&self, vmid: u32) -> EngineResult<GuestStatus>;

    async fn guest_command(&self, vmid: u32, command: GuestCommand) -> EngineResult<TaskId>;

    async fn wait_for_task(&self, task: &TaskId, timeout: Duration) -> EngineResult<()>;

    async fn start(&self, vmid: u32) -> EngineResult<TaskId> {
        self.guest_command(vmid, GuestCommand::Start).await
    }

    async fn stop(&self, vmid: u32) -> EngineResult<TaskId> {
        self.guest_command(vmid, GuestCommand::Stop).await
    }

    async fn shutdown(&self, vmid: u32) -> EngineResult<TaskId> {
        self.guest_command(vmid, GuestCommand::Shutdown).await
    }

    async fn pause(&self, vmid: u32) -> EngineResult<TaskId> {
        self.guest_command(vmid, GuestCommand::Pause).await
    }

    async fn resume(&self, vmid: u32) -> EngineResult<TaskId> {
        self.guest_command(vmid, GuestCommand::Resume).await
    }
}

/// Builds an API handle for a hypervisor host.
pub trait HypervisorConnector: Send + Sync {
    fn connect(&self, host: &HostApi) -> EngineResult<Arc<dyn HypervisorApi>>;
}

pub struct ProxmoxConnector {
    config: HypervisorConfig,
}

impl ProxmoxConnector {
    pub fn new(config: HypervisorConfig) -> Self {
        Self { config }
    }
}

impl HypervisorConnector for ProxmoxConnector {
    fn connect(&self, host: &HostApi) -> EngineResult<Arc<dyn HypervisorApi>> {
        Ok(Arc::new(ProxmoxClient::new(host, &self.config)?))
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

pub struct ProxmoxClient {
    base_url: String,
    node_name: String,
    auth: String,
    http: Client,
}

impl ProxmoxClient {
    pub fn new(host: &HostApi, config: &HypervisorConfig) -> EngineResult<Self> {
        let token = ApiToken::parse(&host.token).ok_or_else(|| {
            EngineError::Authentication(format!(
                "malformed API token for hypervisor '{}'",
                host.node_name
            ))
        })?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| EngineError::Connectivity(format!("building HTTP client: {e}")))?;
        Ok(Self {
            base_url: host.api_url.trim_end_matches('/').to_string(),
            node_name: host.node_name.clone(),
            auth: token.header_value(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api2/json/nodes/{}{}", self.base_url, self.node_name, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> EngineResult<T> {
        let url = self.url(path);
        let resp = self
            .http
            .get(&url)
            .header("Authorization", &self.auth)
            .send()
            .await
            .map_err(|e| EngineError::Connectivity(format!("GET {url}: {e}")))?;
        decode(resp, &url).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str) -> EngineResult<T> {
        let url = self.url(path);
        let resp = self
            .http
            .post(&url)
            .header("Authorization", &self.auth)
            .send()
            .await
            .map_err(|e| EngineError::Connectivity(format!("POST {url}: {e}")))?;
        decode(resp, &url).await
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response, url: &str) -> EngineResult<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(status_error(status, url, body.trim()));
    }
    resp.json::<Envelope<T>>()
        .await
        .map(|e| e.data)
        .map_err(|e| EngineError::Actuation(format!("parsing response from {url}: {e}")))
}

fn status_error(status: StatusCode, url: &str, body: &str) -> EngineError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            EngineError::Authentication(format!("{url} returned {status}"))
        }
        _ => EngineError::Actuation(format!("{url} returned {status}: {body}")),
    }
}

#[async_trait]
impl HypervisorApi for ProxmoxClient {
    async fn list_guests(&self, cancel: &CancellationToken) -> EngineResult<Vec<GuestSummary>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.get("/qemu").await
    }

    async fn guest_status(&self, vmid: u32) -> EngineResult<GuestStatus> {
        self.get(&format!("/qemu/{vmid}/status/current")).await
    }

    async fn guest_command(&self, vmid: u32, command: GuestCommand) -> EngineResult<TaskId> {
        debug!(node = %self.node_name, vmid, command = command.endpoint(), "hypervisor guest command");
        let upid: String = self
            .post(&format!("/qemu/{vmid}/status/{}", command.endpoint()))
            .await?;
        Ok(TaskId(upid))
    }

    async fn wait_for_task(&self, task: &TaskId, timeout: Duration) -> EngineResult<()> {
        let path = format!("/tasks/{}/status", task.0);
        let poll = async {
            loop {
                let status: TaskStatus = self.get(&path).await?;
                if status.status == "stopped" {
                    return match status.exitstatus.as_deref() {
                        Some("OK") => Ok(()),
                        other => Err(EngineError::Actuation(format!(
                            "task {} failed: {}",
                            task.0,
                            other.unwrap_or("no exit status")
                        ))),
                    };
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            EngineError::Actuation(format!("task {} did not finish within {:?}", task.0, timeout))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostApi {
        HostApi {
            node_name: "pve".into(),
            api_url: "https://192.0.2.10:8006/".into(),
            token: "root@pam!ww=abc".into(),
        }
    }

    #[test]
    fn guest_status_maps_to_power_state() {
        let status = |s: &str, q: Option<&str>| GuestStatus {
            status: s.into(),
            qmpstatus: q.map(String::from),
        };
        assert_eq!(status("running", Some("running")).power_state(), PowerState::On);
        assert_eq!(status("running", Some("paused")).power_state(), PowerState::Suspended);
        assert_eq!(status("stopped", None).power_state(), PowerState::Off);
        assert_eq!(status("weird", None).power_state(), PowerState::Unknown);
    }

    #[test]
    fn urls_are_scoped_to_the_host_node() {
        let client = ProxmoxClient::new(&host(), &HypervisorConfig::default()).unwrap();
        assert_eq!(
            client.url("/qemu/101/status/suspend"),
            "https://192.0.2.10:8006/api2/json/nodes/pve/qemu/101/status/suspend"
        );
        assert_eq!(client.auth, "PVEAPIToken=root@pam!ww=abc");
        assert_eq!(GuestCommand::Pause.endpoint(), "suspend");
    }

    #[test]
    fn malformed_token_is_an_authentication_error() {
        let mut bad = host();
        bad.token = "nope".into();
        assert!(matches!(
            ProxmoxClient::new(&bad, &HypervisorConfig::default()),
            Err(EngineError::Authentication(_))
        ));
    }

    #[test]
    fn http_status_maps_to_taxonomy() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "u", ""),
            EngineError::Authentication(_)
        ));
        assert!(matches!(
            status_error(StatusCode::INTERNAL_SERVER_ERROR, "u", "boom"),
            EngineError::Actuation(_)
        ));
    }

    #[tokio::test]
    async fn cancelled_listing_skips_network() {
        let client = ProxmoxClient::new(&host(), &HypervisorConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            client.list_guests(&cancel).await,
            Err(EngineError::Cancelled)
        ));
    }

    #[test]
    fn envelope_decodes_guest_listing() {
        let body = r#"{"data":[{"vmid":101,"name":"media","status":"running","cpu":0.1}]}"#;
        let env: Envelope<Vec<GuestSummary>> = serde_json::from_str(body).unwrap();
        assert_eq!(env.data[0].vmid, 101);
        assert_eq!(env.data[0].name.as_deref(), Some("media"));
    }
}
