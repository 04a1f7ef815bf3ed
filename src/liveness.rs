//! Liveness detection by TCP connect, which needs no elevated privileges
//! (unlike ICMP).

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, Instrument, Span};

use crate::domain::node::Node;
use crate::domain::types::{PowerState, ServiceStatus};

/// Outcome of probing one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub reachable: bool,
    pub services: Vec<ServiceStatus>,
}

#[async_trait]
pub trait Reachability: Send + Sync {
    async fn probe(&self, node: &Node) -> Detection;
}

pub struct LivenessDetector {
    ports: Vec<u16>,
    timeout: Duration,
    span: Span,
}

impl LivenessDetector {
    pub fn new(ports: Vec<u16>, timeout: Duration, span: Span) -> Self {
        Self {
            ports,
            timeout,
            span,
        }
    }

    /// True if any of the common ports accepts a connection.
    pub async fn is_reachable(&self, hostname: &str, timeout: Duration) -> bool {
        for port in &self.ports {
            if port_open(hostname, *port, timeout).await {
                debug!(host = hostname, port, "port answered");
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl Reachability for LivenessDetector {
    async fn probe(&self, node: &Node) -> Detection {
        async {
            let common = self.is_reachable(&node.hostname, self.timeout).await;
            let mut services = Vec::with_capacity(node.services.len());
            for svc in &node.services {
                let up = port_open(&node.hostname, svc.port, self.timeout).await;
                services.push(ServiceStatus {
                    name: svc.name.clone(),
                    port: svc.port,
                    up,
                });
            }
            let reachable = common || services.iter().any(|s| s.up);
            debug!(node = %node.id, reachable, "probe finished");
            Detection {
                reachable,
                services,
            }
        }
        .instrument(self.span.clone())
        .await
    }
}

async fn port_open(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Map reachability onto a power state. Unreachable cannot tell "off" from
/// "suspended", so a node last seen suspended stays suspended, and a node
/// whose initialization failed stays `init_failed` until it answers again.
pub fn classify(reachable: bool, last: PowerState) -> PowerState {
    match (reachable, last) {
        (true, _) => PowerState::On,
        (false, PowerState::Suspended) => PowerState::Suspended,
        (false, PowerState::InitFailed) => PowerState::InitFailed,
        (false, _) => PowerState::Off,
    }
}
