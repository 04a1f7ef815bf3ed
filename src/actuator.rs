//! PowerActuator: turns wake/suspend/shutdown/stop intents into backend calls.
//!
//! Each node maps onto a closed set of backends (`PowerBackend`). Physical
//! hosts are woken with a magic packet and suspended over SSH; hypervisor
//! guests are driven entirely through their host's management API. Every
//! attempt, successful or not, lands in the node's action history.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn, Instrument, Span};

use crate::backends::proxmox::{HypervisorApi, HypervisorConnector, TaskId};
use crate::backends::ssh::{RemoteShell, SshTarget};
use crate::backends::wol::{MacAddress, WakeSender};
use crate::config::{HypervisorConfig, ReconcileConfig, SshConfig, WolConfig};
use crate::domain::node::{Node, NodeRole};
use crate::domain::node_store::NodeStore;
use crate::domain::topology;
use crate::domain::types::{Action, ActionKind, Initiator, PowerState};
use crate::error::{EngineError, EngineResult};

/// Intents the actuator accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerIntent {
    Wake,
    Suspend,
    Shutdown,
    Stop,
}

impl PowerIntent {
    pub fn action_kind(self) -> ActionKind {
        match self {
            PowerIntent::Wake => ActionKind::Wake,
            PowerIntent::Suspend => ActionKind::Suspend,
            PowerIntent::Shutdown => ActionKind::Shutdown,
            PowerIntent::Stop => ActionKind::Stop,
        }
    }

    /// Current states from which the intent may be attempted.
    fn allowed_from(self, state: PowerState) -> bool {
        match self {
            PowerIntent::Wake => true,
            PowerIntent::Suspend | PowerIntent::Shutdown => {
                matches!(state, PowerState::On | PowerState::Unknown)
            }
            PowerIntent::Stop => matches!(
                state,
                PowerState::On | PowerState::Unknown | PowerState::Suspended
            ),
        }
    }
}

/// Power primitives a backend offers. Each returns the state the node is
/// believed to be in afterwards.
#[async_trait]
pub trait PowerControl: Send + Sync {
    async fn wake(&self, current: PowerState) -> EngineResult<PowerState>;
    async fn suspend(&self) -> EngineResult<PowerState>;
    async fn shutdown(&self) -> EngineResult<PowerState>;
    async fn stop(&self) -> EngineResult<PowerState>;
}

pub enum PowerBackend {
    PhysicalHost(PhysicalHost),
    HypervisorGuest(HypervisorGuest),
}

impl PowerBackend {
    fn control(&self) -> &dyn PowerControl {
        match self {
            PowerBackend::PhysicalHost(host) => host,
            PowerBackend::HypervisorGuest(guest) => guest,
        }
    }
}

pub struct PhysicalHost {
    node_id: String,
    mac: Option<String>,
    target: SshTarget,
    shell: Arc<dyn RemoteShell>,
    wake: Arc<dyn WakeSender>,
    wol_targets: Vec<String>,
    suspend_commands: Vec<String>,
}

#[async_trait]
impl PowerControl for PhysicalHost {
    /// Wake has no acknowledgment: success means a packet left this host, and
    /// the node is `unknown` until the next detection pass.
    async fn wake(&self, _current: PowerState) -> EngineResult<PowerState> {
        let raw = self.mac.as_deref().ok_or_else(|| {
            EngineError::Rejected(format!("node '{}' has no MAC address", self.node_id))
        })?;
        let mac: MacAddress = raw.parse()?;
        let accepted = self.wake.send_any(&mac, &self.wol_targets).await?;
        info!(node = %self.node_id, %mac, accepted, "magic packet sent");
        Ok(PowerState::Unknown)
    }

    async fn suspend(&self) -> EngineResult<PowerState> {
        let mut errors = Vec::new();
        for command in &self.suspend_commands {
            match self.shell.execute(&self.target, command).await {
                Ok(()) => {
                    info!(node = %self.node_id, command = %command, "suspend command accepted");
                    return Ok(PowerState::Suspended);
                }
                Err(e @ (EngineError::Connectivity(_) | EngineError::Authentication(_))) => {
                    return Err(e)
                }
                Err(e) => errors.push(format!("{command}: {e}")),
            }
        }
        Err(EngineError::Actuation(if errors.is_empty() {
            "no suspend commands configured".to_string()
        } else {
            errors.join("; ")
        }))
    }

    /// Reuses the suspend path; this is not a true power-off.
    async fn shutdown(&self) -> EngineResult<PowerState> {
        self.suspend().await
    }

    async fn stop(&self) -> EngineResult<PowerState> {
        Err(EngineError::Unsupported(format!(
            "force-stop is only available for hypervisor guests, '{}' is not one",
            self.node_id
        )))
    }
}

pub struct HypervisorGuest {
    node_id: String,
    vmid: u32,
    host: Node,
    api: Arc<dyn HypervisorApi>,
    task_timeout: Duration,
}

impl HypervisorGuest {
    fn require_live_host(&self) -> EngineResult<()> {
        if self.host.current_state == PowerState::On {
            Ok(())
        } else {
            Err(EngineError::Connectivity(format!(
                "hypervisor host '{}' of guest '{}' is {}",
                self.host.id, self.node_id, self.host.current_state
            )))
        }
    }

    async fn finish(&self, task: TaskId) -> EngineResult<()> {
        self.api.wait_for_task(&task, self.task_timeout).await
    }
}

#[async_trait]
impl PowerControl for HypervisorGuest {
    async fn wake(&self, current: PowerState) -> EngineResult<PowerState> {
        // After an unconfirmed wake only the hypervisor knows whether it is paused.
        let paused = match current {
            PowerState::Suspended => true,
            PowerState::Unknown => match self.api.guest_status(self.vmid).await {
                Ok(status) => status.power_state() == PowerState::Suspended,
                Err(e) => {
                    warn!(
                        node = %self.node_id,
                        vmid = self.vmid,
                        error = %e,
                        "guest status unavailable, issuing start"
                    );
                    false
                }
            },
            _ => false,
        };
        let task = if paused {
            self.api.resume(self.vmid).await?
        } else {
            self.api.start(self.vmid).await?
        };
        self.finish(task).await?;
        Ok(PowerState::Unknown)
    }

    async fn suspend(&self) -> EngineResult<PowerState> {
        self.require_live_host()?;
        let task = self.api.pause(self.vmid).await?;
        self.finish(task).await?;
        Ok(PowerState::Suspended)
    }

    async fn shutdown(&self) -> EngineResult<PowerState> {
        self.require_live_host()?;
        let task = self.api.shutdown(self.vmid).await?;
        self.finish(task).await?;
        Ok(PowerState::Off)
    }

    async fn stop(&self) -> EngineResult<PowerState> {
        self.require_live_host()?;
        let task = self.api.stop(self.vmid).await?;
        self.finish(task).await?;
        Ok(PowerState::Off)
    }
}

/// Tunables the actuator needs from configuration.
#[derive(Debug, Clone)]
pub struct ActuatorSettings {
    pub ssh: SshConfig,
    pub wol_targets: Vec<String>,
    pub parent_settle: Duration,
    pub task_timeout: Duration,
}

impl ActuatorSettings {
    pub fn from_config(
        ssh: &SshConfig,
        wol: &WolConfig,
        reconcile: &ReconcileConfig,
        hypervisor: &HypervisorConfig,
    ) -> Self {
        Self {
            ssh: ssh.clone(),
            wol_targets: wol.targets(),
            parent_settle: Duration::from_secs(reconcile.parent_settle_secs),
            task_timeout: Duration::from_secs(hypervisor.task_timeout_secs),
        }
    }
}

type WakeFuture<'a> = Pin<Box<dyn Future<Output = EngineResult<PowerState>> + Send + 'a>>;

pub struct PowerActuator {
    store: Arc<dyn NodeStore>,
    shell: Arc<dyn RemoteShell>,
    wake: Arc<dyn WakeSender>,
    hypervisors: Arc<dyn HypervisorConnector>,
    settings: ActuatorSettings,
    span: Span,
}

impl PowerActuator {
    pub fn new(
        store: Arc<dyn NodeStore>,
        shell: Arc<dyn RemoteShell>,
        wake: Arc<dyn WakeSender>,
        hypervisors: Arc<dyn HypervisorConnector>,
        settings: ActuatorSettings,
        span: Span,
    ) -> Self {
        Self {
            store,
            shell,
            wake,
            hypervisors,
            settings,
            span,
        }
    }

    /// Carry out `intent` on node `id`. The outcome is recorded in the node's
    /// history either way; only a missing node goes unrecorded.
    pub async fn execute(
        &self,
        id: &str,
        intent: PowerIntent,
        initiator: Initiator,
    ) -> EngineResult<PowerState> {
        match intent {
            PowerIntent::Wake => {
                let mut visited = HashSet::new();
                self.wake_recorded(id.to_string(), initiator, &mut visited)
                    .instrument(self.span.clone())
                    .await
            }
            _ => self
                .power_down_recorded(id, intent, initiator)
                .instrument(self.span.clone())
                .await,
        }
    }

    async fn power_down_recorded(
        &self,
        id: &str,
        intent: PowerIntent,
        initiator: Initiator,
    ) -> EngineResult<PowerState> {
        let node = self.store.get(id).await?;
        let result = self.power_down(&node, intent).await;
        self.record(&node.id, intent.action_kind(), initiator, &result)
            .await;
        result
    }

    async fn power_down(&self, node: &Node, intent: PowerIntent) -> EngineResult<PowerState> {
        if !intent.allowed_from(node.current_state) {
            return Err(EngineError::Rejected(format!(
                "cannot {} node '{}' while it is {}",
                intent.action_kind(),
                node.id,
                node.current_state
            )));
        }
        let backend = self.backend_for(node).await?;
        let control = backend.control();
        match intent {
            PowerIntent::Suspend => control.suspend().await,
            PowerIntent::Shutdown => control.shutdown().await,
            PowerIntent::Stop => control.stop().await,
            PowerIntent::Wake => control.wake(node.current_state).await,
        }
    }

    fn wake_recorded<'a>(
        &'a self,
        id: String,
        initiator: Initiator,
        visited: &'a mut HashSet<String>,
    ) -> WakeFuture<'a> {
        Box::pin(async move {
            let node = self.store.get(&id).await?;
            let result = if visited.insert(id.clone()) {
                self.wake_node(&node, initiator, visited).await
            } else {
                Err(crate::error::TopologyError::Cycle(id).into())
            };
            self.record(&node.id, ActionKind::Wake, initiator, &result)
                .await;
            result
        })
    }

    async fn wake_node(
        &self,
        node: &Node,
        initiator: Initiator,
        visited: &mut HashSet<String>,
    ) -> EngineResult<PowerState> {
        if node.current_state == PowerState::On {
            info!(node = %node.id, "wake requested for a node that is already on");
            return Ok(PowerState::On);
        }
        if node.is_guest() {
            topology::resolve_root(self.store.as_ref(), &node.id).await?;
        }
        let backend = self.backend_for(node).await?;
        if let PowerBackend::HypervisorGuest(guest) = &backend {
            if guest.host.current_state != PowerState::On {
                let host_id = guest.host.id.clone();
                info!(
                    node = %node.id,
                    host = %host_id,
                    host_state = %guest.host.current_state,
                    "waking hypervisor host before guest"
                );
                self.store
                    .modify(&host_id, Box::new(|n| n.desired_state = PowerState::On))
                    .await?;
                self.wake_recorded(host_id, initiator, visited).await?;
                tokio::time::sleep(self.settings.parent_settle).await;
            }
        }
        backend.control().wake(node.current_state).await
    }

    async fn backend_for(&self, node: &Node) -> EngineResult<PowerBackend> {
        match &node.role {
            NodeRole::Guest(guest) => {
                let host = topology::guest_host(self.store.as_ref(), node).await?;
                let api = match host.host_api() {
                    Some(host_api) => self.hypervisors.connect(host_api)?,
                    None => {
                        return Err(crate::error::TopologyError::InvalidHost {
                            node: node.id.clone(),
                            parent: host.id.clone(),
                        }
                        .into())
                    }
                };
                Ok(PowerBackend::HypervisorGuest(HypervisorGuest {
                    node_id: node.id.clone(),
                    vmid: guest.vmid,
                    host,
                    api,
                    task_timeout: self.settings.task_timeout,
                }))
            }
            NodeRole::Standalone | NodeRole::HypervisorHost(_) => {
                Ok(PowerBackend::PhysicalHost(PhysicalHost {
                    node_id: node.id.clone(),
                    mac: node.mac.clone(),
                    target: SshTarget::for_node(node, &self.settings.ssh),
                    shell: self.shell.clone(),
                    wake: self.wake.clone(),
                    wol_targets: self.settings.wol_targets.clone(),
                    suspend_commands: self.settings.ssh.suspend_commands.clone(),
                }))
            }
        }
    }

    async fn record(
        &self,
        id: &str,
        kind: ActionKind,
        initiator: Initiator,
        result: &EngineResult<PowerState>,
    ) {
        let action = match result {
            Ok(state) => {
                if let Err(e) = self.store.update_state(id, *state).await {
                    warn!(node = id, error = %e, "failed to update state after {kind}");
                }
                Action::succeeded(kind, initiator)
            }
            Err(e) => {
                warn!(node = id, action = %kind, error = %e, "power action failed");
                Action::failed(kind, initiator, e.to_string())
            }
        };
        if let Err(e) = self.store.append_action(id, action).await {
            warn!(node = id, error = %e, "failed to record action");
        }
    }
}
