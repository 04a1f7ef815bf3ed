//! Typed HTTP client for the wakeward daemon REST API.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use reqwest::Client;

use crate::backends::proxmox::GuestSummary;
use crate::config::ControllerTarget;
use crate::domain::node::Node;
use crate::domain::types::{CommandOutcome, DaemonHealth};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:9200";

/// Node-scoped commands exposed under `/api/v1/nodes/{id}/...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCommand {
    Wake,
    Suspend,
    Shutdown,
    Stop,
    Reconcile,
}

impl NodeCommand {
    fn path(self) -> &'static str {
        match self {
            NodeCommand::Wake => "wake",
            NodeCommand::Suspend => "suspend",
            NodeCommand::Shutdown => "shutdown",
            NodeCommand::Stop => "stop",
            NodeCommand::Reconcile => "reconcile",
        }
    }
}

pub struct WakewardClient {
    base_url: String,
    http: Client,
}

impl WakewardClient {
    pub fn new(base_url: &str) -> Result<Self> {
        // Detect and reconcile passes wait for every node.
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Resolve a client from the controllers map.
    /// `None` name → localhost default. `Some(name)` → look up in the map.
    pub fn from_controller(
        name: Option<&str>,
        controllers: &HashMap<String, ControllerTarget>,
    ) -> Result<Self> {
        match name {
            None => Self::new(DEFAULT_BASE_URL),
            Some(n) => match controllers.get(n) {
                Some(target) => Self::new(&target.url),
                None => bail!(
                    "controller '{}' not found in config. Available controllers: {}",
                    n,
                    if controllers.is_empty() {
                        "(none configured)".to_string()
                    } else {
                        let mut names: Vec<_> = controllers.keys().cloned().collect();
                        names.sort();
                        names.join(", ")
                    }
                ),
            },
        }
    }

    pub async fn health(&self) -> Result<DaemonHealth> {
        self.get("/health").await
    }

    pub async fn nodes(&self) -> Result<Vec<Node>> {
        self.get("/api/v1/nodes").await
    }

    pub async fn node(&self, id: &str) -> Result<Node> {
        self.get(&format!("/api/v1/nodes/{id}")).await
    }

    pub async fn guests(&self, host: &str) -> Result<Vec<GuestSummary>> {
        self.get(&format!("/api/v1/nodes/{host}/guests")).await
    }

    pub async fn command(&self, id: &str, command: NodeCommand) -> Result<CommandOutcome> {
        self.post(&format!("/api/v1/nodes/{id}/{}", command.path()))
            .await
    }

    pub async fn detect(&self) -> Result<CommandOutcome> {
        self.post("/api/v1/detect").await
    }

    pub async fn reconcile(&self) -> Result<CommandOutcome> {
        self.post("/api/v1/reconcile").await
    }

    // ── Internal helpers ───────────────────────────────────

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        Self::decode(&url, resp).await
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;
        Self::decode(&url, resp).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        url: &str,
        resp: reqwest::Response,
    ) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("{} returned {}: {}", url, status, body.trim());
        }
        resp.json()
            .await
            .with_context(|| format!("parsing response from {}", url))
    }
}
