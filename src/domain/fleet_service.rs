//! Fleet service: the command/query surface over the engine.
//!
//! Queries read straight from the store. Commands record the operator's
//! intent as the node's desired state first, then actuate, so the next
//! reconcile pass keeps converging even if the immediate attempt fails.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::actuator::{PowerActuator, PowerIntent};
use crate::backends::proxmox::{GuestSummary, HypervisorConnector};
use crate::config::InventoryEntry;
use crate::error::{EngineError, EngineResult, StoreError};
use crate::reconciler::{PassOutcome, Reconciler};

use super::node::Node;
use super::node_store::NodeStore;
use super::types::{Action, ActionKind, CommandOutcome, DaemonHealth, Initiator, PowerState};

pub struct FleetService {
    store: Arc<dyn NodeStore>,
    reconciler: Arc<Reconciler>,
    actuator: Arc<PowerActuator>,
    hypervisors: Arc<dyn HypervisorConnector>,
    shutdown: CancellationToken,
    controller: String,
    started: Instant,
}

impl FleetService {
    pub fn new(
        store: Arc<dyn NodeStore>,
        reconciler: Arc<Reconciler>,
        actuator: Arc<PowerActuator>,
        hypervisors: Arc<dyn HypervisorConnector>,
        shutdown: CancellationToken,
        controller: impl Into<String>,
    ) -> Self {
        Self {
            store,
            reconciler,
            actuator,
            hypervisors,
            shutdown,
            controller: controller.into(),
            started: Instant::now(),
        }
    }

    /// Merge the declared inventory into the store. Known nodes keep their
    /// runtime fields and take the declared ones; new nodes start unknown.
    pub async fn seed(&self, entries: &[InventoryEntry]) -> usize {
        let mut added = 0;
        for entry in entries {
            let declared = entry.clone();
            match self
                .store
                .modify(&entry.id, Box::new(move |n| declared.apply_to(n)))
                .await
            {
                Ok(_) => {}
                Err(StoreError::NotFound(_)) => {
                    self.store.add(entry.to_node()).await;
                    added += 1;
                }
                Err(e) => tracing::warn!(node = %entry.id, error = %e, "failed to seed node"),
            }
        }
        info!(declared = entries.len(), added, "inventory seeded");
        added
    }

    pub async fn health(&self) -> DaemonHealth {
        DaemonHealth {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
            controller: self.controller.clone(),
            node_count: self.store.get_all().await.len(),
        }
    }

    /// All nodes with credentials redacted.
    pub async fn nodes(&self) -> Vec<Node> {
        self.store
            .get_all()
            .await
            .iter()
            .map(Node::redacted)
            .collect()
    }

    pub async fn node(&self, id: &str) -> Result<Node, StoreError> {
        Ok(self.store.get(id).await?.redacted())
    }

    /// Guests the hypervisor reports for host `id`. Not started once the
    /// daemon is shutting down.
    pub async fn guests(&self, id: &str) -> EngineResult<Vec<GuestSummary>> {
        let host = self.store.get(id).await?;
        let api = match host.host_api() {
            Some(api) if api.has_valid_credentials() => self.hypervisors.connect(api)?,
            _ => {
                return Err(EngineError::Rejected(format!(
                    "node '{id}' is not a hypervisor host with valid credentials"
                )))
            }
        };
        api.list_guests(&self.shutdown).await
    }

    pub async fn detect_now(&self) -> CommandOutcome {
        self.reconciler.detect_all().await;
        CommandOutcome::ok("detection pass complete")
    }

    pub async fn reconcile_now(&self) -> CommandOutcome {
        self.reconciler.reconcile_all().await;
        CommandOutcome::ok("reconcile pass complete")
    }

    /// Out-of-cycle pass for one node, audited as a `reconcile` action.
    pub async fn reconcile_node(&self, id: &str) -> Result<CommandOutcome, StoreError> {
        let result = self.reconciler.reconcile_one(id, Initiator::Manual).await;
        let (action, outcome) = match result {
            Err(EngineError::Store(e)) => return Err(e),
            Ok(PassOutcome::InitFailed) => {
                let msg = format!("node '{id}': {}", PassOutcome::InitFailed);
                (
                    Action::failed(ActionKind::Reconcile, Initiator::Manual, msg.clone()),
                    CommandOutcome::failed(msg),
                )
            }
            Ok(pass) => (
                Action::succeeded(ActionKind::Reconcile, Initiator::Manual),
                CommandOutcome::ok(format!("node '{id}': {pass}")),
            ),
            Err(e) => (
                Action::failed(ActionKind::Reconcile, Initiator::Manual, e.to_string()),
                CommandOutcome::failed(e.to_string()),
            ),
        };
        self.store.append_action(id, action).await?;
        Ok(outcome)
    }

    pub async fn wake(&self, id: &str) -> Result<CommandOutcome, StoreError> {
        self.command(id, PowerIntent::Wake, PowerState::On).await
    }

    pub async fn suspend(&self, id: &str) -> Result<CommandOutcome, StoreError> {
        self.command(id, PowerIntent::Suspend, PowerState::Suspended)
            .await
    }

    pub async fn shutdown(&self, id: &str) -> Result<CommandOutcome, StoreError> {
        self.command(id, PowerIntent::Shutdown, PowerState::Off).await
    }

    pub async fn stop(&self, id: &str) -> Result<CommandOutcome, StoreError> {
        self.command(id, PowerIntent::Stop, PowerState::Off).await
    }

    async fn command(
        &self,
        id: &str,
        intent: PowerIntent,
        desired: PowerState,
    ) -> Result<CommandOutcome, StoreError> {
        self.store
            .modify(id, Box::new(move |n| n.desired_state = desired))
            .await?;
        info!(node = id, action = %intent.action_kind(), desired = %desired, "operator command");

        match self.actuator.execute(id, intent, Initiator::Manual).await {
            Ok(state) => Ok(CommandOutcome::ok(format!(
                "{} sent to '{id}', state now {state}",
                intent.action_kind()
            ))),
            Err(EngineError::Store(e)) => Err(e),
            Err(e) => Ok(CommandOutcome::failed(e.to_string())),
        }
    }
}
