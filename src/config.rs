use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::domain::node::{Node, NodeRole, SshOverrides};
use crate::domain::types::{PowerState, ServicePort};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub wol: WolConfig,
    #[serde(default)]
    pub hypervisor: HypervisorConfig,
    #[serde(default)]
    pub nodes: Vec<InventoryEntry>,
    /// Named daemons the CLI can talk to.
    #[serde(default)]
    pub controllers: HashMap<String, ControllerTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Snapshot file for the durable store. In-memory only when unset.
    #[serde(default)]
    pub state_file: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            state_file: None,
        }
    }
}

fn default_http_addr() -> String {
    "127.0.0.1:9200".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_detect_interval")]
    pub detect_interval_secs: u64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_probe_ports")]
    pub probe_ports: Vec<u16>,
    /// Fixed wait after waking a parent host before acting on its guest.
    #[serde(default = "default_parent_settle")]
    pub parent_settle_secs: u64,
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            detect_interval_secs: default_detect_interval(),
            reconcile_interval_secs: default_reconcile_interval(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_ports: default_probe_ports(),
            parent_settle_secs: default_parent_settle(),
            notification_buffer: default_notification_buffer(),
        }
    }
}

fn default_detect_interval() -> u64 {
    30
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

fn default_probe_ports() -> Vec<u16> {
    vec![80, 443, 22]
}

fn default_parent_settle() -> u64 {
    8
}

fn default_notification_buffer() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Private key path. The SSH agent is used when unset.
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Tried in order; the first that succeeds wins.
    #[serde(default = "default_suspend_commands")]
    pub suspend_commands: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            key_file: None,
            connect_timeout_secs: default_connect_timeout(),
            suspend_commands: default_suspend_commands(),
        }
    }
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_suspend_commands() -> Vec<String> {
    vec![
        "systemctl suspend".to_string(),
        "sudo -n systemctl suspend".to_string(),
        "pm-suspend".to_string(),
        "echo mem > /sys/power/state".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolConfig {
    #[serde(default = "default_broadcast_addrs")]
    pub broadcast_addrs: Vec<String>,
    #[serde(default = "default_wol_ports")]
    pub ports: Vec<u16>,
}

impl Default for WolConfig {
    fn default() -> Self {
        Self {
            broadcast_addrs: default_broadcast_addrs(),
            ports: default_wol_ports(),
        }
    }
}

fn default_broadcast_addrs() -> Vec<String> {
    vec!["255.255.255.255".to_string()]
}

fn default_wol_ports() -> Vec<u16> {
    vec![9, 7]
}

impl WolConfig {
    /// Every broadcast address paired with every wake port.
    pub fn targets(&self) -> Vec<String> {
        self.broadcast_addrs
            .iter()
            .flat_map(|addr| self.ports.iter().map(move |port| format!("{addr}:{port}")))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_accept_invalid_certs")]
    pub accept_invalid_certs: bool,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_api_timeout(),
            task_timeout_secs: default_task_timeout(),
            accept_invalid_certs: default_accept_invalid_certs(),
        }
    }
}

fn default_api_timeout() -> u64 {
    30
}

fn default_task_timeout() -> u64 {
    60
}

fn default_accept_invalid_certs() -> bool {
    true
}

/// One inventory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub hostname: String,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default = "default_desired_state")]
    pub desired_state: PowerState,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub services: Vec<ServicePort>,
    #[serde(default)]
    pub ssh: SshOverrides,
    #[serde(default)]
    pub role: NodeRole,
}

fn default_desired_state() -> PowerState {
    PowerState::On
}

impl InventoryEntry {
    /// A fresh node in `unknown`, not yet initialized.
    pub fn to_node(&self) -> Node {
        let mut node = Node::new(
            &self.id,
            self.name.clone().unwrap_or_else(|| self.id.clone()),
            &self.hostname,
        );
        self.apply_to(&mut node);
        node
    }

    /// Overwrite declared fields on an existing node, keeping runtime state.
    pub fn apply_to(&self, node: &mut Node) {
        node.name = self.name.clone().unwrap_or_else(|| self.id.clone());
        node.hostname = self.hostname.clone();
        if self.mac.is_some() {
            node.mac = self.mac.clone();
        }
        node.desired_state = self.desired_state;
        node.parent_id = self.parent.clone();
        node.services = self.services.clone();
        node.ssh = self.ssh.clone();
        node.role = self.role.clone();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerTarget {
    pub url: String,
}

impl Config {
    pub fn path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(config_dir.join("wakeward").join("config.yaml"))
    }
}

/// Load configuration: defaults, then the YAML file, then `WAKEWARD_*`
/// environment variables (`__` separates nested keys).
pub fn load(path: Option<&str>) -> Result<Config> {
    let path = match path {
        Some(p) => PathBuf::from(p),
        None => Config::path()?,
    };
    figment_for(&path)
        .extract()
        .with_context(|| format!("loading configuration from {}", path.display()))
}

fn figment_for(path: &std::path::Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Yaml::file(path))
        .merge(Env::prefixed("WAKEWARD_").split("__"))
}
