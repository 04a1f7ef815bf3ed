//! Remote command execution over the system `ssh` client.
//!
//! Every operation dials its own connection and tears it down afterwards; no
//! sessions are pooled. Host-key verification is disabled.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::SshConfig;
use crate::domain::node::Node;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// `None` means authenticate through the SSH agent.
    pub key_file: Option<String>,
}

impl SshTarget {
    /// Resolve the connection parameters for a node, applying its overrides.
    pub fn for_node(node: &Node, config: &SshConfig) -> Self {
        Self {
            host: node.hostname.clone(),
            port: node.ssh.port.unwrap_or(config.port),
            user: node.ssh.user.clone().unwrap_or_else(|| config.user.clone()),
            key_file: node
                .ssh
                .key_file
                .clone()
                .or_else(|| config.key_file.clone()),
        }
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn execute_with_output(&self, target: &SshTarget, command: &str) -> EngineResult<String>;

    async fn execute(&self, target: &SshTarget, command: &str) -> EngineResult<()> {
        self.execute_with_output(target, command).await.map(|_| ())
    }

    /// `exit 0` is understood by both POSIX shells and cmd.exe.
    async fn test_connection(&self, target: &SshTarget) -> EngineResult<()> {
        self.execute(target, "exit 0").await
    }
}

pub struct SshCommand {
    connect_timeout: Duration,
}

impl SshCommand {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl RemoteShell for SshCommand {
    async fn execute_with_output(&self, target: &SshTarget, command: &str) -> EngineResult<String> {
        let args = ssh_args(target, self.connect_timeout, command);
        debug!(host = %target.host, command, "running remote command");

        let output = Command::new("ssh")
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::Connectivity(format!("spawning ssh: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(
                &target.host,
                output.status.code(),
                stderr.trim(),
            ))
        }
    }
}

fn ssh_args(target: &SshTarget, connect_timeout: Duration, command: &str) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-p".to_string(),
        target.port.to_string(),
    ];
    if let Some(key) = &target.key_file {
        args.push("-i".to_string());
        args.push(key.clone());
        args.push("-o".to_string());
        args.push("IdentitiesOnly=yes".to_string());
    }
    args.push(format!("{}@{}", target.user, target.host));
    args.push(command.to_string());
    args
}

/// ssh exits 255 on its own errors; anything else is the remote command's status.
fn classify_failure(host: &str, code: Option<i32>, stderr: &str) -> EngineError {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied")
        || lower.contains("no such identity")
        || lower.contains("too many authentication failures")
    {
        return EngineError::Authentication(format!("{host}: {stderr}"));
    }
    match code {
        Some(255) | None => EngineError::Connectivity(format!("{host}: {stderr}")),
        Some(code) => EngineError::Actuation(format!("{host}: exit status {code}: {stderr}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::SshOverrides;

    #[test]
    fn node_overrides_win_over_globals() {
        let mut node = Node::new("n", "n", "n.lan");
        node.ssh = SshOverrides {
            user: Some("admin".into()),
            port: None,
            key_file: Some("/keys/n".into()),
        };
        let target = SshTarget::for_node(&node, &SshConfig::default());
        assert_eq!(target.user, "admin");
        assert_eq!(target.port, 22);
        assert_eq!(target.key_file.as_deref(), Some("/keys/n"));
        assert_eq!(target.host, "n.lan");
    }

    #[test]
    fn args_disable_host_key_checks_and_pass_key() {
        let target = SshTarget {
            host: "box".into(),
            port: 2222,
            user: "root".into(),
            key_file: Some("/k".into()),
        };
        let args = ssh_args(&target, Duration::from_secs(10), "uname -s");
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/k"));
        assert_eq!(args[args.len() - 2], "root@box");
        assert_eq!(args[args.len() - 1], "uname -s");
    }

    #[test]
    fn agent_auth_omits_identity_flag() {
        let target = SshTarget {
            host: "box".into(),
            port: 22,
            user: "root".into(),
            key_file: None,
        };
        assert!(!ssh_args(&target, Duration::from_secs(5), "true").contains(&"-i".to_string()));
    }

    #[test]
    fn failures_map_to_taxonomy() {
        assert!(matches!(
            classify_failure("h", Some(255), "Permission denied (publickey)."),
            EngineError::Authentication(_)
        ));
        assert!(matches!(
            classify_failure("h", Some(255), "connect to host h port 22: Connection timed out"),
            EngineError::Connectivity(_)
        ));
        assert!(matches!(
            classify_failure("h", Some(1), "Failed to suspend system"),
            EngineError::Actuation(_)
        ));
    }
}
