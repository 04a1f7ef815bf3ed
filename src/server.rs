use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span};

use crate::actuator::{ActuatorSettings, PowerActuator};
use crate::api::rest::{self, AppState};
use crate::backends::proxmox::ProxmoxConnector;
use crate::backends::ssh::SshCommand;
use crate::backends::wol::UdpWakeSender;
use crate::config::{Config, DaemonConfig};
use crate::domain::fleet_service::FleetService;
use crate::domain::node_store::{MemoryStore, NodeStore};
use crate::domain::snapshot_store::JsonFileStore;
use crate::initializer::Initializer;
use crate::liveness::LivenessDetector;
use crate::reconciler::{Reconciler, ReconcilerSettings, StateChange};

fn init_tracing(config: &DaemonConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_store(config: &DaemonConfig) -> Arc<dyn NodeStore> {
    match &config.state_file {
        Some(path) => Arc::new(JsonFileStore::open(PathBuf::from(path)).await),
        None => {
            info!("no state_file configured, node state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    }
}

pub async fn run(config: Config) -> Result<()> {
    init_tracing(&config.daemon);

    info!(version = env!("CARGO_PKG_VERSION"), "wakeward daemon starting");

    let store = open_store(&config.daemon).await;

    let probe_timeout = Duration::from_millis(config.reconcile.probe_timeout_ms);
    let detector = Arc::new(LivenessDetector::new(
        config.reconcile.probe_ports.clone(),
        probe_timeout,
        info_span!("liveness"),
    ));
    let shell = Arc::new(SshCommand::new(Duration::from_secs(
        config.ssh.connect_timeout_secs,
    )));
    let hypervisors = Arc::new(ProxmoxConnector::new(config.hypervisor.clone()));
    let actuator = Arc::new(PowerActuator::new(
        store.clone(),
        shell.clone(),
        Arc::new(UdpWakeSender),
        hypervisors.clone(),
        ActuatorSettings::from_config(
            &config.ssh,
            &config.wol,
            &config.reconcile,
            &config.hypervisor,
        ),
        info_span!("actuator"),
    ));
    let initializer = Arc::new(Initializer::new(
        store.clone(),
        shell,
        config.ssh.clone(),
        info_span!("initializer"),
    ));

    let (notify_tx, notify_rx) = mpsc::channel(config.reconcile.notification_buffer.max(1));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        detector,
        actuator.clone(),
        initializer,
        ReconcilerSettings::from(&config.reconcile),
        Some(notify_tx),
        info_span!("reconciler"),
    ));

    let controller = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "wakeward".to_string());
    let cancel = CancellationToken::new();
    let fleet = Arc::new(FleetService::new(
        store.clone(),
        reconciler.clone(),
        actuator,
        hypervisors,
        cancel.clone(),
        controller,
    ));
    fleet.seed(&config.nodes).await;

    let app = rest::router(AppState {
        fleet: fleet.clone(),
    })
    .layer(TraceLayer::new_for_http());

    // Bind HTTP listener
    let http_addr = &config.daemon.http_addr;
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding to {}", http_addr))?;

    info!(addr = %http_addr, nodes = config.nodes.len(), "HTTP server listening");

    tokio::spawn(log_state_changes(notify_rx));
    let engine = tokio::spawn(reconciler.run(cancel.clone()));

    // Run HTTP server with graceful shutdown
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    cancel.cancel();
    engine.await.context("reconciler task failed")?;

    info!("wakeward daemon stopped");
    Ok(())
}

/// Subscriber for state-change notifications; a presentation layer would
/// broadcast these to live clients.
async fn log_state_changes(mut rx: mpsc::Receiver<StateChange>) {
    while let Some(change) = rx.recv().await {
        let up: Vec<&str> = change
            .services
            .iter()
            .filter(|s| s.up)
            .map(|s| s.name.as_str())
            .collect();
        info!(
            node = %change.node_id,
            state = %change.state,
            services_up = ?up,
            "node state changed"
        );
    }
    debug!("state change stream closed");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down"); },
        _ = terminate => { info!("Received SIGTERM, shutting down"); },
    }
}
