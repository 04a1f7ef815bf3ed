//! Initializer: first-contact capability probe of a node over SSH.
//!
//! Steps run best-effort: only the connectivity check can abort the probe.
//! Probing:
//! - family: uname, /etc/pve, cmd /c ver
//! - identity: /etc/os-release, pveversion, /etc/machine-id, wmic
//! - network: ip -o link, ip -o addr
//! - usage: /proc/loadavg, /proc/meminfo, /proc/stat, df, /proc/net/dev
//! - wake-on-LAN: ethtool

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn, Instrument, Span};

use crate::backends::ssh::{RemoteShell, SshTarget};
use crate::backends::wol::MacAddress;
use crate::config::SshConfig;
use crate::domain::node::Node;
use crate::domain::node_store::NodeStore;
use crate::domain::types::{
    Action, ActionKind, Capabilities, Initiator, NetworkInterface, PowerState, ResourceUsage,
    SystemFamily, SystemInfo, WakeOnLan,
};
use crate::error::EngineResult;

const USAGE_COMMAND: &str = "cat /proc/loadavg; echo ---; cat /proc/meminfo; echo ---; \
     head -1 /proc/stat; sleep 1; head -1 /proc/stat; echo ---; df -B1 / | tail -1; echo ---; \
     cat /proc/net/dev";

/// What one probe learned about a node.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub connected: bool,
    pub info: SystemInfo,
    /// Primary link-layer address, when the node had none.
    pub mac: Option<String>,
    pub errors: Vec<String>,
}

pub struct Initializer {
    store: Arc<dyn NodeStore>,
    shell: Arc<dyn RemoteShell>,
    ssh: SshConfig,
    span: Span,
}

impl Initializer {
    pub fn new(
        store: Arc<dyn NodeStore>,
        shell: Arc<dyn RemoteShell>,
        ssh: SshConfig,
        span: Span,
    ) -> Self {
        Self {
            store,
            shell,
            ssh,
            span,
        }
    }

    /// Probe node `id` and persist the outcome. Returns whether the node is
    /// now initialized.
    pub async fn initialize(&self, id: &str, initiator: Initiator) -> EngineResult<bool> {
        async {
            let node = self.store.get(id).await?;
            info!(node = %node.id, host = %node.hostname, "probing node capabilities");
            let report = self.probe(&node).await;
            self.persist(&node.id, report, initiator).await
        }
        .instrument(self.span.clone())
        .await
    }

    async fn persist(
        &self,
        id: &str,
        report: ProbeReport,
        initiator: Initiator,
    ) -> EngineResult<bool> {
        let connected = report.connected;
        let attempted_at = Utc::now();
        let errors = report.errors.join("; ");
        let info = report.info;
        let mac = report.mac;

        self.store
            .modify(
                id,
                Box::new(move |n| {
                    n.system_info = Some(info);
                    n.last_init_attempt = Some(attempted_at);
                    if connected {
                        n.initialized = true;
                        n.init_retry_count = 0;
                        if n.mac.is_none() {
                            n.mac = mac;
                        }
                    } else {
                        n.initialized = false;
                        n.init_retry_count += 1;
                    }
                }),
            )
            .await?;

        let state = if connected {
            PowerState::On
        } else {
            PowerState::InitFailed
        };
        self.store.update_state(id, state).await?;

        let mut action = if connected {
            Action::succeeded(ActionKind::Initialize, initiator)
        } else {
            Action::failed(ActionKind::Initialize, initiator, errors.clone())
        };
        if connected && !errors.is_empty() {
            action.error = Some(errors.clone());
        }
        self.store.append_action(id, action).await?;

        if connected {
            if errors.is_empty() {
                info!(node = id, "node initialized");
            } else {
                warn!(node = id, errors = %errors, "node initialized with partial probe failures");
            }
        } else {
            warn!(node = id, error = %errors, "node initialization failed");
        }
        Ok(connected)
    }

    /// Run every probe step against `node` without touching the store.
    pub async fn probe(&self, node: &Node) -> ProbeReport {
        let target = SshTarget::for_node(node, &self.ssh);
        let mut errors = Vec::new();
        let mut info = SystemInfo {
            probed_at: Some(Utc::now()),
            ..SystemInfo::default()
        };

        if let Err(e) = self.shell.test_connection(&target).await {
            errors.push(format!("connection: {e}"));
            return ProbeReport {
                connected: false,
                info,
                mac: None,
                errors,
            };
        }

        info.family = self.detect_family(&target).await;

        match self.os_version(&target, info.family).await {
            Ok(v) => info.os_version = v,
            Err(e) => errors.push(format!("os version: {e}")),
        }
        match self.system_id(&target, info.family).await {
            Ok(v) => info.system_id = v,
            Err(e) => errors.push(format!("system id: {e}")),
        }
        let unix_like = matches!(info.family, SystemFamily::Linux | SystemFamily::Proxmox);
        if unix_like {
            match self.interfaces(&target).await {
                Ok(list) => info.interfaces = list,
                Err(e) => errors.push(format!("interfaces: {e}")),
            }
            match self.shell.execute_with_output(&target, USAGE_COMMAND).await {
                Ok(out) => info.usage = parse_usage(&out),
                Err(e) => errors.push(format!("resource usage: {e}")),
            }
        }

        let mac = match &node.mac {
            Some(_) => None,
            None => primary_interface(&info.interfaces, None).and_then(|i| i.mac.clone()),
        };

        info.capabilities = Capabilities::defaults_for(info.family);
        if unix_like {
            let wanted_mac = node.mac.as_deref().or(mac.as_deref());
            let previous = node
                .system_info
                .as_ref()
                .map(|s| s.capabilities.wol.clone());
            if let Some(iface) = primary_interface(&info.interfaces, wanted_mac) {
                let name = iface.name.clone();
                match self.probe_wol(&target, &name, previous, &mut errors).await {
                    Ok(wol) => {
                        info.capabilities.wake_on_lan = wol.supported;
                        info.capabilities.wol = wol;
                    }
                    Err(e) => errors.push(format!("wake-on-lan: {e}")),
                }
            }
        }

        ProbeReport {
            connected: true,
            info,
            mac,
            errors,
        }
    }

    async fn detect_family(&self, target: &SshTarget) -> SystemFamily {
        match self.shell.execute_with_output(target, "uname -s").await {
            Ok(out) if out.trim() == "Linux" => {
                if self.shell.execute(target, "test -d /etc/pve").await.is_ok() {
                    SystemFamily::Proxmox
                } else {
                    SystemFamily::Linux
                }
            }
            Ok(_) => SystemFamily::Unknown,
            Err(_) => match self.shell.execute_with_output(target, "cmd /c ver").await {
                Ok(out) if out.contains("Windows") => SystemFamily::Windows,
                _ => SystemFamily::Unknown,
            },
        }
    }

    async fn os_version(
        &self,
        target: &SshTarget,
        family: SystemFamily,
    ) -> EngineResult<Option<String>> {
        match family {
            SystemFamily::Linux => {
                let out = self
                    .shell
                    .execute_with_output(target, "cat /etc/os-release")
                    .await?;
                Ok(parse_os_release(&out))
            }
            SystemFamily::Proxmox => {
                let out = self.shell.execute_with_output(target, "pveversion").await?;
                Ok(non_empty(out.trim()))
            }
            SystemFamily::Windows => {
                let out = self.shell.execute_with_output(target, "cmd /c ver").await?;
                Ok(non_empty(out.trim()))
            }
            SystemFamily::Unknown => Ok(None),
        }
    }

    async fn system_id(
        &self,
        target: &SshTarget,
        family: SystemFamily,
    ) -> EngineResult<Option<String>> {
        match family {
            SystemFamily::Linux | SystemFamily::Proxmox => {
                let out = self
                    .shell
                    .execute_with_output(target, "cat /etc/machine-id")
                    .await?;
                Ok(non_empty(out.trim()))
            }
            SystemFamily::Windows => {
                let out = self
                    .shell
                    .execute_with_output(target, "wmic csproduct get uuid")
                    .await?;
                Ok(out
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("uuid"))
                    .map(String::from)
                    .next())
            }
            SystemFamily::Unknown => Ok(None),
        }
    }

    async fn interfaces(&self, target: &SshTarget) -> EngineResult<Vec<NetworkInterface>> {
        let links = self
            .shell
            .execute_with_output(target, "ip -o link show")
            .await?;
        let addrs = self
            .shell
            .execute_with_output(target, "ip -o addr show")
            .await?;
        Ok(parse_interfaces(&links, &addrs))
    }

    /// Read wake-on-LAN state for `iface`, arming it when supported but not
    /// armed. An interface already armed is never re-armed, and a failed
    /// re-probe does not clear a previously observed armed flag.
    async fn probe_wol(
        &self,
        target: &SshTarget,
        iface: &str,
        previous: Option<WakeOnLan>,
        errors: &mut Vec<String>,
    ) -> EngineResult<WakeOnLan> {
        let query = format!("ethtool {iface}");
        let out = self.shell.execute_with_output(target, &query).await?;
        let (supported, mut armed) = parse_ethtool(&out);

        let previously_armed = previous
            .as_ref()
            .map(|w| w.armed && w.interface.as_deref() == Some(iface))
            .unwrap_or(false);

        if supported && !armed {
            match self
                .shell
                .execute(target, &format!("ethtool -s {iface} wol g"))
                .await
            {
                Ok(()) => match self.shell.execute_with_output(target, &query).await {
                    Ok(again) => armed = parse_ethtool(&again).1,
                    Err(e) => {
                        errors.push(format!("wake-on-lan re-probe: {e}"));
                        armed = previously_armed;
                    }
                },
                Err(e) => errors.push(format!("wake-on-lan arm: {e}")),
            }
        }

        Ok(WakeOnLan {
            supported,
            interface: Some(iface.to_string()),
            armed,
        })
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn parse_os_release(content: &str) -> Option<String> {
    let field = |key: &str| {
        content.lines().find_map(|l| {
            l.strip_prefix(key)
                .and_then(|v| v.strip_prefix('='))
                .map(|v| v.trim().trim_matches('"').to_string())
        })
    };
    field("PRETTY_NAME").or_else(|| field("NAME"))
}

/// Join `ip -o link` (names and MACs) with `ip -o addr` (addresses). An
/// interface without addresses still yields one link-only entry.
fn parse_interfaces(links: &str, addrs: &str) -> Vec<NetworkInterface> {
    let mut macs: HashMap<String, Option<String>> = HashMap::new();
    let mut order = Vec::new();
    for line in links.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_), Some(raw_name)) = (fields.next(), fields.next()) else {
            continue;
        };
        let name = clean_name(raw_name);
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let mac = tokens
            .iter()
            .position(|t| *t == "link/ether")
            .and_then(|i| tokens.get(i + 1))
            .map(|m| m.to_lowercase());
        if !macs.contains_key(&name) {
            order.push(name.clone());
        }
        macs.insert(name, mac);
    }

    let mut result = Vec::new();
    let mut addressed = std::collections::HashSet::new();
    for line in addrs.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 4 {
            continue;
        }
        let name = clean_name(tokens[1]);
        let ipv6 = match tokens[2] {
            "inet" => false,
            "inet6" => true,
            _ => continue,
        };
        let ip = tokens[3].split('/').next().map(String::from);
        addressed.insert(name.clone());
        result.push(NetworkInterface {
            mac: macs.get(&name).cloned().flatten(),
            name,
            ip,
            ipv6,
        });
    }

    for name in order {
        if !addressed.contains(&name) {
            result.push(NetworkInterface {
                mac: macs.get(&name).cloned().flatten(),
                name,
                ip: None,
                ipv6: false,
            });
        }
    }
    result
}

fn clean_name(raw: &str) -> String {
    let name = raw.trim_end_matches(':');
    name.split('@').next().unwrap_or(name).to_string()
}

const VIRTUAL_PREFIXES: &[&str] = &[
    "lo", "vmbr", "br", "docker", "veth", "virbr", "tap", "tun", "wg", "fwbr", "fwpr", "fwln",
];

/// 0 for Ethernet-style names, 1 for other physical names, `None` for
/// virtual, bridge and loopback interfaces.
fn interface_rank(name: &str) -> Option<u8> {
    if VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p)) {
        None
    } else if name.starts_with("en") || name.starts_with("eth") {
        Some(0)
    } else {
        Some(1)
    }
}

/// Best interface for wake purposes, optionally restricted to one MAC.
fn primary_interface<'a>(
    interfaces: &'a [NetworkInterface],
    mac: Option<&str>,
) -> Option<&'a NetworkInterface> {
    let wanted = mac.and_then(|m| m.parse::<MacAddress>().ok());
    interfaces
        .iter()
        .filter(|i| !i.ipv6)
        .filter_map(|i| {
            let parsed = i.mac.as_deref()?.parse::<MacAddress>().ok()?;
            if parsed.is_zero() || wanted.is_some_and(|w| w != parsed) {
                return None;
            }
            interface_rank(&i.name).map(|rank| (rank, i))
        })
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, i)| i)
}

/// Returns `(supported, armed)`; magic-packet wake is flag `g`.
fn parse_ethtool(out: &str) -> (bool, bool) {
    let mut supported = false;
    let mut armed = false;
    for line in out.lines().map(str::trim) {
        if let Some(flags) = line.strip_prefix("Supports Wake-on:") {
            supported = flags.trim().contains('g');
        } else if let Some(flags) = line.strip_prefix("Wake-on:") {
            armed = flags.trim().contains('g');
        }
    }
    (supported, armed)
}

fn parse_usage(out: &str) -> ResourceUsage {
    let sections: Vec<&str> = out.split("---").map(str::trim).collect();
    let mut usage = ResourceUsage {
        sampled_at: Some(Utc::now()),
        ..ResourceUsage::default()
    };

    if let Some(load) = sections.first() {
        let mut parts = load.split_whitespace().map(|v| v.parse::<f64>().ok());
        usage.load_1 = parts.next().flatten();
        usage.load_5 = parts.next().flatten();
        usage.load_15 = parts.next().flatten();
    }

    if let Some(meminfo) = sections.get(1) {
        let kib = |key: &str| {
            meminfo.lines().find_map(|l| {
                l.strip_prefix(key)?
                    .trim()
                    .split_whitespace()
                    .next()?
                    .parse::<u64>()
                    .ok()
                    .map(|v| v * 1024)
            })
        };
        usage.memory_total_bytes = kib("MemTotal:");
        usage.memory_available_bytes = kib("MemAvailable:");
    }

    if let Some(stat) = sections.get(2) {
        let samples: Vec<Vec<u64>> = stat
            .lines()
            .filter(|l| l.starts_with("cpu "))
            .map(|l| l.split_whitespace().skip(1).filter_map(|v| v.parse().ok()).collect())
            .collect();
        if let [first, second] = samples.as_slice() {
            usage.cpu_percent = cpu_percent(first, second);
        }
    }

    if let Some(df) = sections.get(3) {
        let fields: Vec<&str> = df.split_whitespace().collect();
        if fields.len() >= 4 {
            usage.disk_total_bytes = fields[1].parse().ok();
            usage.disk_used_bytes = fields[2].parse().ok();
        }
    }

    if let Some(netdev) = sections.get(4) {
        let (mut rx, mut tx, mut seen) = (0u64, 0u64, false);
        for line in netdev.lines() {
            let Some((name, counters)) = line.split_once(':') else {
                continue;
            };
            if name.trim() == "lo" {
                continue;
            }
            let values: Vec<u64> = counters
                .split_whitespace()
                .filter_map(|v| v.parse().ok())
                .collect();
            if values.len() >= 9 {
                rx += values[0];
                tx += values[8];
                seen = true;
            }
        }
        if seen {
            usage.net_rx_bytes = Some(rx);
            usage.net_tx_bytes = Some(tx);
        }
    }

    usage
}

/// Busy share between two `/proc/stat` cpu lines (idle + iowait are idle).
fn cpu_percent(first: &[u64], second: &[u64]) -> Option<f64> {
    if first.len() < 5 || second.len() < 5 {
        return None;
    }
    let total = |v: &[u64]| v.iter().sum::<u64>();
    let idle = |v: &[u64]| v[3] + v[4];
    let dt = total(second).checked_sub(total(first))?;
    let di = idle(second).checked_sub(idle(first))?;
    if dt == 0 {
        return None;
    }
    Some((dt.saturating_sub(di)) as f64 * 100.0 / dt as f64)
}
