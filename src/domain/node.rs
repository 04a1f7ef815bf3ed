//! Node: a managed physical host or virtual machine.
//!
//! A `Node` carries both the operator's intent (`desired_state`) and the last
//! observed reality (`current_state`), plus accrued per-state durations and a
//! bounded action history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::{Action, DurationBucket, PowerState, ServicePort, SystemInfo};

/// Maximum number of actions retained per node.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub mac: Option<String>,
    pub current_state: PowerState,
    pub desired_state: PowerState,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub role: NodeRole,
    #[serde(default)]
    pub services: Vec<ServicePort>,
    #[serde(default)]
    pub ssh: SshOverrides,
    pub initialized: bool,
    pub init_retry_count: u32,
    #[serde(default)]
    pub last_init_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub system_info: Option<SystemInfo>,
    pub total_on_time: f64,
    pub total_suspended_time: f64,
    pub total_off_time: f64,
    pub last_state_change: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// How a node participates in virtualization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeRole {
    #[default]
    Standalone,
    HypervisorHost(HostApi),
    Guest(GuestRef),
}

/// Management-API coordinates of a hypervisor host.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct HostApi {
    /// The hypervisor's own name for this host (e.g. `pve1`).
    pub node_name: String,
    pub api_url: String,
    /// `user@realm!tokenId=secret`
    pub token: String,
}

impl fmt::Debug for HostApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostApi")
            .field("node_name", &self.node_name)
            .field("api_url", &self.api_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl HostApi {
    /// Credentials are valid when the URL is set and the token parses.
    pub fn has_valid_credentials(&self) -> bool {
        !self.api_url.trim().is_empty() && ApiToken::parse(&self.token).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestRef {
    /// Name of the hypervisor node hosting the guest.
    pub node_name: String,
    pub vmid: u32,
}

/// Per-node overrides of the global SSH settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshOverrides {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub key_file: Option<String>,
}

/// Parsed hypervisor API token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiToken {
    pub user: String,
    pub realm: String,
    pub token_id: String,
    pub secret: String,
}

impl ApiToken {
    pub fn parse(raw: &str) -> Option<Self> {
        let (principal, secret) = raw.trim().split_once('=')?;
        let (identity, token_id) = principal.split_once('!')?;
        let (user, realm) = identity.split_once('@')?;
        if [user, realm, token_id, secret].iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(Self {
            user: user.to_string(),
            realm: realm.to_string(),
            token_id: token_id.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Value for the `Authorization` header.
    pub fn header_value(&self) -> String {
        format!(
            "PVEAPIToken={}@{}!{}={}",
            self.user, self.realm, self.token_id, self.secret
        )
    }
}

impl Node {
    pub fn new(id: impl Into<String>, name: impl Into<String>, hostname: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            hostname: hostname.into(),
            mac: None,
            current_state: PowerState::Unknown,
            desired_state: PowerState::Unknown,
            parent_id: None,
            role: NodeRole::Standalone,
            services: Vec::new(),
            ssh: SshOverrides::default(),
            initialized: false,
            init_retry_count: 0,
            last_init_attempt: None,
            system_info: None,
            total_on_time: 0.0,
            total_suspended_time: 0.0,
            total_off_time: 0.0,
            last_state_change: now,
            created_at: now,
            actions: Vec::new(),
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self.role, NodeRole::Guest(_))
    }

    pub fn host_api(&self) -> Option<&HostApi> {
        match &self.role {
            NodeRole::HypervisorHost(api) => Some(api),
            _ => None,
        }
    }

    /// Move to `state` at `at`, rolling the time spent in the previous state
    /// into its counter. Returns false (and changes nothing) when the state is
    /// unchanged.
    pub fn transition(&mut self, state: PowerState, at: DateTime<Utc>) -> bool {
        if state == self.current_state {
            return false;
        }
        let elapsed = elapsed_secs(self.last_state_change, at);
        self.accrue(self.current_state.bucket(), elapsed);
        self.current_state = state;
        if at > self.last_state_change {
            self.last_state_change = at;
        }
        true
    }

    fn accrue(&mut self, bucket: DurationBucket, secs: f64) {
        match bucket {
            DurationBucket::On => self.total_on_time += secs,
            DurationBucket::Suspended => self.total_suspended_time += secs,
            DurationBucket::Off => self.total_off_time += secs,
        }
    }

    /// Totals as of `at`, including the still-open current segment.
    pub fn totals_at(&self, at: DateTime<Utc>) -> (f64, f64, f64) {
        let open = elapsed_secs(self.last_state_change, at);
        let (mut on, mut suspended, mut off) =
            (self.total_on_time, self.total_suspended_time, self.total_off_time);
        match self.current_state.bucket() {
            DurationBucket::On => on += open,
            DurationBucket::Suspended => suspended += open,
            DurationBucket::Off => off += open,
        }
        (on, suspended, off)
    }

    /// Append an action, evicting the oldest entries beyond the history limit.
    pub fn push_action(&mut self, action: Action) {
        self.actions.push(action);
        if self.actions.len() > HISTORY_LIMIT {
            let excess = self.actions.len() - HISTORY_LIMIT;
            self.actions.drain(..excess);
        }
    }

    /// Copy safe to hand to API consumers: hypervisor secrets are blanked.
    pub fn redacted(&self) -> Self {
        let mut node = self.clone();
        if let NodeRole::HypervisorHost(api) = &mut node.role {
            api.token = match ApiToken::parse(&api.token) {
                Some(t) => format!("{}@{}!{}=***", t.user, t.realm, t.token_id),
                None => String::new(),
            };
        }
        node
    }
}

fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let ms = to.signed_duration_since(from).num_milliseconds();
    if ms > 0 {
        ms as f64 / 1000.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{ActionKind, Initiator};
    use chrono::Duration;

    fn node_at(t0: DateTime<Utc>) -> Node {
        let mut node = Node::new("n1", "n1", "n1.lan");
        node.created_at = t0;
        node.last_state_change = t0;
        node
    }

    #[test]
    fn durations_sum_to_observed_wall_time() {
        let t0 = Utc::now();
        let mut node = node_at(t0);
        let steps = [
            (PowerState::On, 10),
            (PowerState::Suspended, 25),
            (PowerState::On, 40),
            (PowerState::InitFailed, 41),
            (PowerState::Off, 100),
            (PowerState::On, 130),
        ];
        for (state, secs) in steps {
            node.transition(state, t0 + Duration::seconds(secs));
        }
        let end = t0 + Duration::seconds(200);
        let (on, suspended, off) = node.totals_at(end);
        assert!((on + suspended + off - 200.0).abs() < 1e-6);
        assert!((suspended - 15.0).abs() < 1e-6);
        // unknown 0..10, init_failed 41..100, off 100..130
        assert!((off - (10.0 + 59.0 + 30.0)).abs() < 1e-6);
    }

    #[test]
    fn same_state_transition_is_a_no_op() {
        let t0 = Utc::now();
        let mut node = node_at(t0);
        assert!(node.transition(PowerState::On, t0 + Duration::seconds(5)));
        assert!(!node.transition(PowerState::On, t0 + Duration::seconds(50)));
        assert_eq!(node.last_state_change, t0 + Duration::seconds(5));
        assert_eq!(node.total_on_time, 0.0);
    }

    #[test]
    fn counters_never_decrease_when_clock_steps_back() {
        let t0 = Utc::now();
        let mut node = node_at(t0);
        node.transition(PowerState::On, t0 + Duration::seconds(10));
        let before = node.total_off_time;
        node.transition(PowerState::Off, t0);
        assert!(node.total_on_time >= 0.0);
        assert!(node.total_off_time >= before);
        assert_eq!(node.last_state_change, t0 + Duration::seconds(10));
    }

    #[test]
    fn history_keeps_fifty_most_recent_in_order() {
        let mut node = Node::new("n1", "n1", "n1.lan");
        let t0 = Utc::now();
        for i in 0..73 {
            let mut action = Action::succeeded(ActionKind::Wake, Initiator::System);
            action.timestamp = t0 + Duration::seconds(i);
            node.push_action(action);
        }
        assert_eq!(node.actions.len(), HISTORY_LIMIT);
        assert_eq!(node.actions[0].timestamp, t0 + Duration::seconds(23));
        assert_eq!(node.actions[49].timestamp, t0 + Duration::seconds(72));
        assert!(node.actions.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn api_token_parses_proxmox_format() {
        let token = ApiToken::parse("root@pam!wakeward=0f0e-aa").unwrap();
        assert_eq!(token.user, "root");
        assert_eq!(token.realm, "pam");
        assert_eq!(token.token_id, "wakeward");
        assert_eq!(token.secret, "0f0e-aa");
        assert_eq!(token.header_value(), "PVEAPIToken=root@pam!wakeward=0f0e-aa");
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for raw in ["", "root@pam", "root@pam!id", "root!id=s", "@pam!id=s", "root@pam!id="] {
            assert!(ApiToken::parse(raw).is_none(), "{raw} should not parse");
        }
    }

    #[test]
    fn redaction_blanks_token_secret() {
        let mut node = Node::new("pve", "pve", "pve.lan");
        node.role = NodeRole::HypervisorHost(HostApi {
            node_name: "pve".into(),
            api_url: "https://pve.lan:8006".into(),
            token: "root@pam!ww=secret".into(),
        });
        let redacted = node.redacted();
        assert_eq!(redacted.host_api().unwrap().token, "root@pam!ww=***");
        assert_eq!(node.host_api().unwrap().token, "root@pam!ww=secret");
    }
}
