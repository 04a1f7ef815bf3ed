use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend power-state vocabulary. Flat classification, not a transition tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    Suspended,
    #[default]
    Unknown,
    InitFailed,
}

impl PowerState {
    /// The duration bucket this state accrues time into.
    pub fn bucket(self) -> DurationBucket {
        match self {
            PowerState::On => DurationBucket::On,
            PowerState::Suspended => DurationBucket::Suspended,
            PowerState::Off | PowerState::Unknown | PowerState::InitFailed => DurationBucket::Off,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Suspended => "suspended",
            PowerState::Unknown => "unknown",
            PowerState::InitFailed => "init_failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationBucket {
    On,
    Suspended,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SystemFamily {
    Linux,
    Windows,
    Proxmox,
    #[default]
    Unknown,
}

impl fmt::Display for SystemFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SystemFamily::Linux => "linux",
            SystemFamily::Windows => "windows",
            SystemFamily::Proxmox => "proxmox",
            SystemFamily::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Initialize,
    Wake,
    Suspend,
    Shutdown,
    Stop,
    Reconcile,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Initialize => "initialize",
            ActionKind::Wake => "wake",
            ActionKind::Suspend => "suspend",
            ActionKind::Shutdown => "shutdown",
            ActionKind::Stop => "stop",
            ActionKind::Reconcile => "reconcile",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    Manual,
    System,
    Reconciler,
}

/// Immutable audit record of one actuation or probe attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub timestamp: DateTime<Utc>,
    pub kind: ActionKind,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub initiator: Initiator,
}

impl Action {
    pub fn succeeded(kind: ActionKind, initiator: Initiator) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            success: true,
            error: None,
            initiator,
        }
    }

    pub fn failed(kind: ActionKind, initiator: Initiator, error: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            success: false,
            error: Some(error.into()),
            initiator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    pub ipv6: bool,
}

/// Point-in-time resource sample. Not a history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: Option<f64>,
    pub load_1: Option<f64>,
    pub load_5: Option<f64>,
    pub load_15: Option<f64>,
    pub memory_total_bytes: Option<u64>,
    pub memory_available_bytes: Option<u64>,
    pub disk_total_bytes: Option<u64>,
    pub disk_used_bytes: Option<u64>,
    pub net_rx_bytes: Option<u64>,
    pub net_tx_bytes: Option<u64>,
    pub sampled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WakeOnLan {
    pub supported: bool,
    #[serde(default)]
    pub interface: Option<String>,
    pub armed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub suspend: bool,
    pub hibernate: bool,
    pub physical_switch: bool,
    pub wake_on_lan: bool,
    pub power_metering: bool,
    pub power_estimation: bool,
    #[serde(default)]
    pub wol: WakeOnLan,
}

impl Capabilities {
    /// Default matrix for a system family, before active probing.
    pub fn defaults_for(family: SystemFamily) -> Self {
        match family {
            SystemFamily::Linux | SystemFamily::Proxmox | SystemFamily::Windows => Self {
                suspend: true,
                hibernate: true,
                physical_switch: false,
                wake_on_lan: true,
                power_metering: false,
                power_estimation: true,
                wol: WakeOnLan::default(),
            },
            SystemFamily::Unknown => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub family: SystemFamily,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub system_id: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub usage: ResourceUsage,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub probed_at: Option<DateTime<Utc>>,
}

/// A declared TCP service on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub port: u16,
    pub up: bool,
}

/// Result of an operator command, returned verbatim to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
}

impl CommandOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonHealth {
    pub version: String,
    pub uptime_secs: u64,
    pub controller: String,
    pub node_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_state_serializes_snake_case() {
        let json = serde_json::to_string(&PowerState::InitFailed).unwrap();
        assert_eq!(json, "\"init_failed\"");
        let back: PowerState = serde_json::from_str("\"suspended\"").unwrap();
        assert_eq!(back, PowerState::Suspended);
    }

    #[test]
    fn init_failed_and_unknown_accrue_off_time() {
        assert_eq!(PowerState::InitFailed.bucket(), DurationBucket::Off);
        assert_eq!(PowerState::Unknown.bucket(), DurationBucket::Off);
        assert_eq!(PowerState::Suspended.bucket(), DurationBucket::Suspended);
    }

    #[test]
    fn unknown_family_has_no_capabilities() {
        assert_eq!(
            Capabilities::defaults_for(SystemFamily::Unknown),
            Capabilities::default()
        );
        let linux = Capabilities::defaults_for(SystemFamily::Linux);
        assert!(linux.suspend && linux.hibernate && linux.wake_on_lan && linux.power_estimation);
        assert!(!linux.physical_switch && !linux.power_metering);
    }
}
