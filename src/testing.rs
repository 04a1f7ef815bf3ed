//! Recording fakes for the backend traits, shared by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::backends::proxmox::{
    GuestCommand, GuestStatus, GuestSummary, HypervisorApi, HypervisorConnector, TaskId,
};
use crate::actuator::{ActuatorSettings, PowerActuator};
use crate::backends::ssh::{RemoteShell, SshTarget};
use crate::backends::wol::{MacAddress, WakeSender};
use crate::config::Config;
use crate::domain::fleet_service::FleetService;
use crate::domain::node::{HostApi, Node};
use crate::domain::node_store::MemoryStore;
use crate::error::{EngineError, EngineResult};
use crate::initializer::Initializer;
use crate::liveness::LivenessDetector;
use crate::reconciler::{Reconciler, ReconcilerSettings};
use tracing::Span;

/// Ordered record of every backend call, across all fakes.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

type Scripted = VecDeque<Result<String, String>>;

/// Remote shell with scripted per-command responses. A scripted sequence is
/// consumed front to back and its last entry repeats.
pub struct FakeShell {
    log: EventLog,
    responses: Mutex<HashMap<String, Scripted>>,
    unreachable: Mutex<HashSet<String>>,
}

impl FakeShell {
    pub fn new(log: EventLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            responses: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
        })
    }

    pub fn respond(&self, command: &str, output: &str) {
        self.script(command, vec![Ok(output.to_string())]);
    }

    pub fn fail(&self, command: &str, error: &str) {
        self.script(command, vec![Err(error.to_string())]);
    }

    pub fn script(&self, command: &str, outputs: Vec<Result<String, String>>) {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), outputs.into());
    }

    pub fn set_unreachable(&self, host: &str) {
        self.unreachable.lock().unwrap().insert(host.to_string());
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn execute_with_output(&self, target: &SshTarget, command: &str) -> EngineResult<String> {
        self.log.push(format!("ssh {} {}", target.host, command));
        if self.unreachable.lock().unwrap().contains(&target.host) {
            return Err(EngineError::Connectivity(format!("{}: timed out", target.host)));
        }
        let mut responses = self.responses.lock().unwrap();
        let next = match responses.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None if command == "exit 0" => Some(Ok(String::new())),
            None => None,
        };
        match next {
            Some(Ok(out)) => Ok(out),
            Some(Err(e)) => Err(EngineError::Actuation(e)),
            None => Err(EngineError::Actuation(format!("unscripted command: {command}"))),
        }
    }
}

#[derive(Default)]
pub struct FakeWake {
    log: EventLog,
    failing: Mutex<HashSet<String>>,
}

impl FakeWake {
    pub fn new(log: EventLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            failing: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail_addr(&self, addr: &str) {
        self.failing.lock().unwrap().insert(addr.to_string());
    }
}

#[async_trait]
impl WakeSender for FakeWake {
    async fn send(&self, mac: &MacAddress, addr: &str) -> EngineResult<()> {
        if self.failing.lock().unwrap().contains(addr) {
            return Err(EngineError::Connectivity(format!("{addr}: network unreachable")));
        }
        self.log.push(format!("wol {mac} {addr}"));
        Ok(())
    }
}

/// Hypervisor shared by every API handle the connector hands out.
pub struct FakeHypervisor {
    log: EventLog,
    failing: Mutex<HashSet<(u32, &'static str)>>,
    statuses: Mutex<HashMap<u32, GuestStatus>>,
}

impl FakeHypervisor {
    pub fn new(log: EventLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            failing: Mutex::new(HashSet::new()),
            statuses: Mutex::new(HashMap::new()),
        })
    }

    /// Status reported for `vmid`; guests default to running.
    pub fn set_status(&self, vmid: u32, status: &str, qmpstatus: Option<&str>) {
        self.statuses.lock().unwrap().insert(
            vmid,
            GuestStatus {
                status: status.to_string(),
                qmpstatus: qmpstatus.map(String::from),
            },
        );
    }

    pub fn fail_status(&self, vmid: u32) {
        self.failing.lock().unwrap().insert((vmid, "status"));
    }

    pub fn fail(&self, vmid: u32, command: GuestCommand) {
        self.failing
            .lock()
            .unwrap()
            .insert((vmid, command_name(command)));
    }
}

fn command_name(command: GuestCommand) -> &'static str {
    match command {
        GuestCommand::Start => "start",
        GuestCommand::Stop => "stop",
        GuestCommand::Shutdown => "shutdown",
        GuestCommand::Pause => "pause",
        GuestCommand::Resume => "resume",
    }
}

struct FakeApi {
    node: String,
    inner: Arc<FakeHypervisor>,
}

#[async_trait]
impl HypervisorApi for FakeApi {
    async fn list_guests(&self, cancel: &CancellationToken) -> EngineResult<Vec<GuestSummary>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.inner.log.push(format!("api {} list", self.node));
        let statuses = self.inner.statuses.lock().unwrap();
        let mut guests: Vec<_> = statuses
            .iter()
            .map(|(vmid, s)| GuestSummary {
                vmid: *vmid,
                name: None,
                status: s.status.clone(),
            })
            .collect();
        guests.sort_by_key(|g| g.vmid);
        Ok(guests)
    }

    async fn guest_status(&self, vmid: u32) -> EngineResult<GuestStatus> {
        self.inner.log.push(format!("api {} status {}", self.node, vmid));
        if self.inner.failing.lock().unwrap().contains(&(vmid, "status")) {
            return Err(EngineError::Connectivity(format!("status {vmid}: timed out")));
        }
        let statuses = self.inner.statuses.lock().unwrap();
        Ok(statuses.get(&vmid).cloned().unwrap_or(GuestStatus {
            status: "running".into(),
            qmpstatus: None,
        }))
    }

    async fn guest_command(&self, vmid: u32, command: GuestCommand) -> EngineResult<TaskId> {
        let name = command_name(command);
        self.inner
            .log
            .push(format!("api {} {} {}", self.node, name, vmid));
        if self.inner.failing.lock().unwrap().contains(&(vmid, name)) {
            return Err(EngineError::Actuation(format!("{name} {vmid}: VM is locked")));
        }
        Ok(TaskId(format!("UPID:{}:{name}:{vmid}", self.node)))
    }

    async fn wait_for_task(&self, _task: &TaskId, _timeout: Duration) -> EngineResult<()> {
        Ok(())
    }
}

pub struct FakeConnector {
    pub hypervisor: Arc<FakeHypervisor>,
}

impl HypervisorConnector for FakeConnector {
    fn connect(&self, host: &HostApi) -> EngineResult<Arc<dyn HypervisorApi>> {
        Ok(Arc::new(FakeApi {
            node: host.node_name.clone(),
            inner: self.hypervisor.clone(),
        }))
    }
}

/// A fleet service over fakes: nothing is reachable and no probe ports are
/// configured.
pub fn fleet(nodes: Vec<Node>) -> (Arc<MemoryStore>, EventLog, FleetService) {
    let store = Arc::new(MemoryStore::with_nodes(nodes));
    let log = EventLog::default();
    let shell = FakeShell::new(log.clone());
    let cfg = Config::default();
    let mut settings =
        ActuatorSettings::from_config(&cfg.ssh, &cfg.wol, &cfg.reconcile, &cfg.hypervisor);
    settings.parent_settle = Duration::from_millis(1);
    let actuator = Arc::new(PowerActuator::new(
        store.clone(),
        shell.clone(),
        FakeWake::new(log.clone()),
        Arc::new(FakeConnector {
            hypervisor: FakeHypervisor::new(log.clone()),
        }),
        settings,
        Span::none(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        Arc::new(LivenessDetector::new(
            Vec::new(),
            Duration::from_millis(10),
            Span::none(),
        )),
        actuator.clone(),
        Arc::new(Initializer::new(
            store.clone(),
            shell,
            cfg.ssh.clone(),
            Span::none(),
        )),
        ReconcilerSettings::from(&cfg.reconcile),
        None,
        Span::none(),
    ));
    let svc = FleetService::new(
        store.clone(),
        reconciler,
        actuator,
        Arc::new(FakeConnector {
            hypervisor: FakeHypervisor::new(log.clone()),
        }),
        CancellationToken::new(),
        "ctl",
    );
    (store, log, svc)
}
