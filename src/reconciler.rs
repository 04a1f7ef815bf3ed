//! Reconciliation loop: periodic liveness detection plus desired/current
//! convergence, fanned out one task per node.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::actuator::{PowerActuator, PowerIntent};
use crate::config::ReconcileConfig;
use crate::domain::node::Node;
use crate::domain::node_store::{NodeStore, StateRule};
use crate::domain::types::{Initiator, PowerState, ServiceStatus};
use crate::error::EngineResult;
use crate::initializer::Initializer;
use crate::liveness::{classify, Reachability};

/// Published whenever detection moves a node to a different state.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub node_id: String,
    pub state: PowerState,
    pub services: Vec<ServiceStatus>,
    pub node: Node,
}

/// The next thing a reconcile pass should do for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Initialize,
    Actuate(PowerIntent),
    Idle,
}

/// What a single-node pass ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Idle,
    InitFailed,
    Actuated {
        intent: PowerIntent,
        state: PowerState,
    },
}

impl fmt::Display for PassOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassOutcome::Idle => write!(f, "already converged"),
            PassOutcome::InitFailed => write!(f, "initialization failed"),
            PassOutcome::Actuated { intent, state } => {
                write!(f, "{} issued, state now {state}", intent.action_kind())
            }
        }
    }
}

pub fn plan(node: &Node) -> Step {
    if !node.initialized {
        return Step::Initialize;
    }
    use PowerState::*;
    match (node.desired_state, node.current_state) {
        (_, InitFailed | Unknown) => Step::Idle,
        (On, Off | Suspended) => Step::Actuate(PowerIntent::Wake),
        (Suspended, On) => Step::Actuate(PowerIntent::Suspend),
        (Off, On) => Step::Actuate(PowerIntent::Shutdown),
        (Off, Suspended) if node.is_guest() => Step::Actuate(PowerIntent::Stop),
        _ => Step::Idle,
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub detect_interval: Duration,
    pub reconcile_interval: Duration,
}

impl From<&ReconcileConfig> for ReconcilerSettings {
    fn from(cfg: &ReconcileConfig) -> Self {
        Self {
            detect_interval: Duration::from_secs(cfg.detect_interval_secs.max(1)),
            reconcile_interval: Duration::from_secs(cfg.reconcile_interval_secs.max(1)),
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn NodeStore>,
    detector: Arc<dyn Reachability>,
    actuator: Arc<PowerActuator>,
    initializer: Arc<Initializer>,
    settings: ReconcilerSettings,
    notify: Option<mpsc::Sender<StateChange>>,
    span: Span,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn NodeStore>,
        detector: Arc<dyn Reachability>,
        actuator: Arc<PowerActuator>,
        initializer: Arc<Initializer>,
        settings: ReconcilerSettings,
        notify: Option<mpsc::Sender<StateChange>>,
        span: Span,
    ) -> Self {
        Self {
            store,
            detector,
            actuator,
            initializer,
            settings,
            notify,
            span,
        }
    }

    /// Run both periodic loops until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            detect_secs = self.settings.detect_interval.as_secs(),
            reconcile_secs = self.settings.reconcile_interval.as_secs(),
            "reconciler started"
        );
        let detect = tokio::spawn(self.clone().detect_loop(cancel.clone()));
        let reconcile = tokio::spawn(self.clone().reconcile_loop(cancel));
        let (d, r) = tokio::join!(detect, reconcile);
        for result in [d, r] {
            if let Err(e) = result {
                error!(error = %e, "reconciler loop aborted");
            }
        }
        info!("reconciler stopped");
    }

    async fn detect_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.detect_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.detect_all().await,
            }
        }
    }

    async fn reconcile_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.settings.reconcile_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.reconcile_all().await,
            }
        }
    }

    /// One detection pass over every node, concurrently.
    pub async fn detect_all(self: &Arc<Self>) {
        let nodes = self.store.get_all().await;
        let handles: Vec<_> = nodes
            .into_iter()
            .map(|node| {
                let this = self.clone();
                tokio::spawn(
                    async move { this.detect_one(node).await }.instrument(self.span.clone()),
                )
            })
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "detection task panicked");
            }
        }
    }

    async fn detect_one(&self, node: Node) {
        let detection = self.detector.probe(&node).await;
        let reachable = detection.reachable;
        // Classify against the stored state, which may have moved during the probe.
        let rule: StateRule = Box::new(move |last| classify(reachable, last));
        match self.store.update_state_from(&node.id, rule).await {
            Ok(t) if t.changed() => {
                info!(node = %node.id, from = %t.from, to = %t.to, "state changed");
                if let Ok(snapshot) = self.store.get(&node.id).await {
                    self.publish(StateChange {
                        node_id: node.id.clone(),
                        state: t.to,
                        services: detection.services,
                        node: snapshot,
                    });
                }
            }
            Ok(t) => debug!(node = %node.id, state = %t.to, "state unchanged"),
            // Removed between listing and probing.
            Err(e) => debug!(node = %node.id, error = %e, "skipping detection result"),
        }
    }

    fn publish(&self, change: StateChange) {
        let Some(tx) = &self.notify else {
            return;
        };
        match tx.try_send(change) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                debug!(node = %dropped.node_id, "notification queue full, dropping newest")
            }
            Err(TrySendError::Closed(_)) => debug!("notification subscriber gone"),
        }
    }

    /// One reconcile pass over every node, concurrently.
    pub async fn reconcile_all(self: &Arc<Self>) {
        let nodes = self.store.get_all().await;
        let handles: Vec<_> = nodes
            .into_iter()
            .map(|node| {
                let this = self.clone();
                tokio::spawn(
                    async move {
                        if let Err(e) = this.reconcile_one(&node.id, Initiator::Reconciler).await
                        {
                            warn!(node = %node.id, error = %e, "reconcile failed");
                        }
                    }
                    .instrument(self.span.clone()),
                )
            })
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "reconcile task panicked");
            }
        }
    }

    /// Converge a single node: initialize if needed, then actuate toward the
    /// desired state.
    pub async fn reconcile_one(&self, id: &str, initiator: Initiator) -> EngineResult<PassOutcome> {
        let mut node = self.store.get(id).await?;
        if plan(&node) == Step::Initialize {
            if !self.initializer.initialize(id, initiator).await? {
                return Ok(PassOutcome::InitFailed);
            }
            node = self.store.get(id).await?;
        }
        match plan(&node) {
            Step::Actuate(intent) => {
                info!(
                    node = id,
                    desired = %node.desired_state,
                    current = %node.current_state,
                    action = %intent.action_kind(),
                    "converging node"
                );
                let state = self.actuator.execute(id, intent, initiator).await?;
                Ok(PassOutcome::Actuated { intent, state })
            }
            Step::Initialize | Step::Idle => Ok(PassOutcome::Idle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::ActuatorSettings;
    use crate::backends::wol::{magic_packet, MacAddress};
    use crate::config::Config;
    use crate::domain::node::{GuestRef, HostApi, NodeRole};
    use crate::domain::node_store::MemoryStore;
    use crate::domain::types::ActionKind;
    use crate::liveness::Detection;
    use crate::testing::{EventLog, FakeConnector, FakeHypervisor, FakeShell, FakeWake};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Reachability decided by a fixed set of hostnames.
    #[derive(Default)]
    struct FakeReach {
        up: Mutex<HashSet<String>>,
        /// Applied to the store while the next probe is in flight.
        during_probe: Mutex<Option<(Arc<MemoryStore>, PowerState)>>,
    }

    impl FakeReach {
        fn up(&self, host: &str) {
            self.up.lock().unwrap().insert(host.to_string());
        }
    }

    #[async_trait]
    impl Reachability for FakeReach {
        async fn probe(&self, node: &Node) -> Detection {
            let pending = self.during_probe.lock().unwrap().take();
            if let Some((store, state)) = pending {
                store.update_state(&node.id, state).await.unwrap();
            }
            Detection {
                reachable: self.up.lock().unwrap().contains(&node.hostname),
                services: Vec::new(),
            }
        }
    }

    struct Rig {
        store: Arc<MemoryStore>,
        log: EventLog,
        shell: Arc<FakeShell>,
        reach: Arc<FakeReach>,
        reconciler: Arc<Reconciler>,
    }

    fn rig(nodes: Vec<Node>, notify: Option<mpsc::Sender<StateChange>>) -> Rig {
        let store = Arc::new(MemoryStore::with_nodes(nodes));
        let log = EventLog::default();
        let shell = FakeShell::new(log.clone());
        let reach = Arc::new(FakeReach::default());
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
        let initializer = Arc::new(Initializer::new(
            store.clone(),
            shell.clone(),
            cfg.ssh.clone(),
            Span::none(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            reach.clone(),
            actuator,
            initializer,
            ReconcilerSettings::from(&cfg.reconcile),
            notify,
            Span::none(),
        ));
        Rig {
            store,
            log,
            shell,
            reach,
            reconciler,
        }
    }

    fn ready(id: &str, desired: PowerState, current: PowerState) -> Node {
        let mut node = Node::new(id, id, format!("{id}.lan"));
        node.initialized = true;
        node.desired_state = desired;
        node.current_state = current;
        node
    }

    #[test]
    fn plan_table() {
        use PowerState::*;
        let cases = [
            (On, Off, Step::Actuate(PowerIntent::Wake)),
            (On, Suspended, Step::Actuate(PowerIntent::Wake)),
            (On, On, Step::Idle),
            (On, Unknown, Step::Idle),
            (On, InitFailed, Step::Idle),
            (Suspended, On, Step::Actuate(PowerIntent::Suspend)),
            (Suspended, Off, Step::Idle),
            (Off, On, Step::Actuate(PowerIntent::Shutdown)),
            (Off, Suspended, Step::Idle),
            (Off, Off, Step::Idle),
        ];
        for (desired, current, expected) in cases {
            assert_eq!(
                plan(&ready("n", desired, current)),
                expected,
                "desired {desired} current {current}"
            );
        }

        let mut guest = ready("vm", Off, Suspended);
        guest.role = NodeRole::Guest(GuestRef {
            node_name: "pve".into(),
            vmid: 100,
        });
        assert_eq!(plan(&guest), Step::Actuate(PowerIntent::Stop));

        let mut fresh = ready("new", On, Off);
        fresh.initialized = false;
        assert_eq!(plan(&fresh), Step::Initialize);
    }

    #[tokio::test]
    async fn offline_node_is_woken_with_magic_packets() {
        let mut node = ready("nas", PowerState::On, PowerState::Off);
        node.mac = Some("AA:BB:CC:DD:EE:FF".into());
        let r = rig(vec![node], None);

        r.reconciler.reconcile_all().await;

        assert_eq!(
            r.log.events(),
            vec![
                "wol aa:bb:cc:dd:ee:ff 255.255.255.255:9",
                "wol aa:bb:cc:dd:ee:ff 255.255.255.255:7",
            ]
        );
        let packet = magic_packet(&"AA:BB:CC:DD:EE:FF".parse::<MacAddress>().unwrap());
        assert_eq!(packet.len(), 102);
        assert!(packet[..6].iter().all(|b| *b == 0xFF));
        assert_eq!(&packet[6..12], &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

        let node = r.store.get("nas").await.unwrap();
        assert_eq!(node.current_state, PowerState::Unknown);
        let wakes: Vec<_> = node
            .actions
            .iter()
            .filter(|a| a.kind == ActionKind::Wake)
            .collect();
        assert_eq!(wakes.len(), 1);
        assert!(wakes[0].success);
        assert_eq!(wakes[0].initiator, Initiator::Reconciler);
    }

    #[tokio::test]
    async fn failed_init_retries_every_pass_and_skips_actuation() {
        let mut node = Node::new("flaky", "flaky", "flaky.lan");
        node.desired_state = PowerState::Off;
        let r = rig(vec![node], None);
        r.shell.set_unreachable("flaky.lan");

        for _ in 0..3 {
            r.reconciler.reconcile_all().await;
        }

        let node = r.store.get("flaky").await.unwrap();
        assert_eq!(node.current_state, PowerState::InitFailed);
        assert_eq!(node.init_retry_count, 3);
        assert_eq!(r.log.count("ssh flaky.lan exit 0"), 3);
        assert!(node.actions.iter().all(|a| a.kind == ActionKind::Initialize));
    }

    #[tokio::test]
    async fn successful_init_continues_into_actuation() {
        let mut node = Node::new("box", "box", "box.lan");
        node.desired_state = PowerState::Suspended;
        let r = rig(vec![node], None);
        r.shell.respond("uname -s", "Darwin\n");
        r.shell.respond("systemctl suspend", "");

        let outcome = r
            .reconciler
            .reconcile_one("box", Initiator::Manual)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PassOutcome::Actuated {
                intent: PowerIntent::Suspend,
                state: PowerState::Suspended
            }
        );
        let node = r.store.get("box").await.unwrap();
        assert!(node.initialized);
        assert_eq!(node.current_state, PowerState::Suspended);
    }

    #[tokio::test]
    async fn one_failing_node_does_not_block_others() {
        let mut bad = ready("bad", PowerState::On, PowerState::Off);
        bad.mac = None;
        let mut good = ready("good", PowerState::On, PowerState::Off);
        good.mac = Some("00:11:22:33:44:55".into());
        let r = rig(vec![bad, good], None);

        r.reconciler.reconcile_all().await;

        let bad = r.store.get("bad").await.unwrap();
        assert!(!bad.actions[0].success);
        let good = r.store.get("good").await.unwrap();
        assert_eq!(good.current_state, PowerState::Unknown);
        assert!(good.actions[0].success);
    }

    #[tokio::test]
    async fn guest_wake_orders_host_first() {
        let mut host = ready("pve", PowerState::On, PowerState::Off);
        host.mac = Some("aa:bb:cc:00:00:01".into());
        host.role = NodeRole::HypervisorHost(HostApi {
            node_name: "pve".into(),
            api_url: "https://pve.lan:8006".into(),
            token: "root@pam!ww=secret".into(),
        });
        let mut guest = ready("media", PowerState::On, PowerState::Off);
        guest.parent_id = Some("pve".into());
        guest.role = NodeRole::Guest(GuestRef {
            node_name: "pve".into(),
            vmid: 101,
        });
        let r = rig(vec![host, guest], None);

        r.reconciler
            .reconcile_one("media", Initiator::Reconciler)
            .await
            .unwrap();

        let wol = r.log.position("wol aa:bb:cc:00:00:01").unwrap();
        let start = r.log.position("api pve start 101").unwrap();
        assert!(wol < start);
    }

    #[tokio::test]
    async fn detection_updates_state_and_notifies() {
        let (tx, mut rx) = mpsc::channel(8);
        let r = rig(
            vec![
                ready("up", PowerState::On, PowerState::Unknown),
                ready("asleep", PowerState::On, PowerState::Suspended),
                ready("steady", PowerState::On, PowerState::Off),
            ],
            Some(tx),
        );
        r.reach.up("up.lan");

        r.reconciler.detect_all().await;

        assert_eq!(
            r.store.get("up").await.unwrap().current_state,
            PowerState::On
        );
        assert_eq!(
            r.store.get("asleep").await.unwrap().current_state,
            PowerState::Suspended
        );
        let change = rx.try_recv().unwrap();
        assert_eq!(change.node_id, "up");
        assert_eq!(change.state, PowerState::On);
        assert_eq!(change.node.current_state, PowerState::On);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn suspend_during_probe_is_not_overwritten() {
        let (tx, mut rx) = mpsc::channel(8);
        let r = rig(
            vec![ready("nas", PowerState::Suspended, PowerState::On)],
            Some(tx),
        );
        *r.reach.during_probe.lock().unwrap() = Some((r.store.clone(), PowerState::Suspended));

        r.reconciler.detect_all().await;

        let nas = r.store.get("nas").await.unwrap();
        assert_eq!(nas.current_state, PowerState::Suspended);
        assert!(rx.try_recv().is_err());

        // Later unreachable probes keep it suspended.
        r.reconciler.detect_all().await;
        assert_eq!(
            r.store.get("nas").await.unwrap().current_state,
            PowerState::Suspended
        );
    }

    #[tokio::test]
    async fn full_notification_queue_drops_newest() {
        let (tx, mut rx) = mpsc::channel(1);
        let r = rig(
            vec![
                ready("a", PowerState::On, PowerState::Off),
                ready("b", PowerState::On, PowerState::Off),
                ready("c", PowerState::On, PowerState::Off),
            ],
            Some(tx),
        );
        for host in ["a.lan", "b.lan", "c.lan"] {
            r.reach.up(host);
        }

        r.reconciler.detect_all().await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        for id in ["a", "b", "c"] {
            assert_eq!(r.store.get(id).await.unwrap().current_state, PowerState::On);
        }
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let r = rig(vec![ready("n", PowerState::On, PowerState::On)], None);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(r.reconciler.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
