//! JsonFileStore: durable NodeStore backed by an atomic, checksummed snapshot.
//!
//! All reads are served from the in-memory store. After every successful
//! mutation the full inventory is written to a `.tmp` file and renamed over
//! the snapshot under a write lock, so the file on disk is always complete.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::node::Node;
use super::node_store::{MemoryStore, NodeMutation, NodeStore, StateRule, Transition};
use super::types::{Action, PowerState, SystemInfo};
use crate::error::StoreError;

/// On-disk form. `nodes` is kept as the exact text that was hashed, so
/// verification never depends on a parse and re-serialize cycle.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredSnapshot {
    /// "sha256:<hex>" of the `nodes` text.
    pub checksum: String,
    pub written_at: DateTime<Utc>,
    pub writer_version: String,
    pub nodes: Box<RawValue>,
}

impl StoredSnapshot {
    pub fn seal(nodes: &[Node]) -> Result<Self, StoreError> {
        let text = serde_json::to_string(nodes)
            .map_err(|e| StoreError::Persist(format!("serializing nodes: {e}")))?;
        let checksum = digest(&text);
        let nodes = RawValue::from_string(text)
            .map_err(|e| StoreError::Persist(format!("wrapping nodes: {e}")))?;
        Ok(Self {
            checksum,
            written_at: Utc::now(),
            writer_version: env!("CARGO_PKG_VERSION").to_string(),
            nodes,
        })
    }

    pub fn verify(&self) -> bool {
        self.checksum == digest(self.nodes.get())
    }

    /// Verified inventory.
    pub fn unseal(&self) -> Result<Vec<Node>, StoreError> {
        if !self.verify() {
            return Err(StoreError::Persist(format!(
                "checksum mismatch (recorded {})",
                self.checksum
            )));
        }
        serde_json::from_str(self.nodes.get())
            .map_err(|e| StoreError::Persist(format!("decoding nodes: {e}")))
    }
}

fn digest(text: &str) -> String {
    format!("sha256:{:x}", Sha256::digest(text.as_bytes()))
}

fn io_error(action: &str, path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let target = path.display().to_string();
    let action = action.to_string();
    move |e| StoreError::Persist(format!("{action} {target}: {e}"))
}

/// Replace `path` with `bytes` so readers only ever see a complete file.
async fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(io_error("creating", dir))?;
    }
    let staging = path.with_extension("json.tmp");
    tokio::fs::write(&staging, bytes)
        .await
        .map_err(io_error("writing", &staging))?;
    tokio::fs::rename(&staging, path)
        .await
        .map_err(io_error("moving snapshot into", path))
}

pub struct JsonFileStore {
    inner: MemoryStore,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store, loading the snapshot at `path` when it exists and
    /// verifies. A corrupt snapshot is discarded and the store starts empty.
    pub async fn open(path: PathBuf) -> Self {
        let nodes = match load(&path).await {
            Ok(Some(nodes)) => {
                info!(path = %path.display(), nodes = nodes.len(), "loaded state snapshot");
                nodes
            }
            Ok(None) => {
                info!(path = %path.display(), "no state snapshot found, starting empty");
                Vec::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable state snapshot");
                Vec::new()
            }
        };

        Self {
            inner: MemoryStore::with_nodes(nodes),
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Write the current inventory to disk.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = StoredSnapshot::seal(&self.inner.get_all().await)?;
        let body = serde_json::to_vec(&snapshot)
            .map_err(|e| StoreError::Persist(format!("encoding snapshot: {e}")))?;
        replace_file(&self.path, &body).await?;
        debug!(path = %self.path.display(), checksum = %snapshot.checksum, "state snapshot written");
        Ok(())
    }

    async fn persist(&self) {
        if let Err(e) = self.flush().await {
            warn!(path = %self.path.display(), error = %e, "failed to persist state snapshot");
        }
    }
}

async fn load(path: &Path) -> Result<Option<Vec<Node>>, StoreError> {
    let body = match tokio::fs::read(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error("reading", path)(e)),
    };
    let snapshot: StoredSnapshot = serde_json::from_slice(&body)
        .map_err(|e| StoreError::Persist(format!("parsing {}: {e}", path.display())))?;
    snapshot.unseal().map(Some)
}

#[async_trait]
impl NodeStore for JsonFileStore {
    async fn get(&self, id: &str) -> Result<Node, StoreError> {
        self.inner.get(id).await
    }

    async fn get_all(&self) -> Vec<Node> {
        self.inner.get_all().await
    }

    async fn add(&self, node: Node) {
        self.inner.add(node).await;
        self.persist().await;
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete(id).await?;
        self.persist().await;
        Ok(())
    }

    async fn update(&self, node: Node) -> Result<(), StoreError> {
        self.inner.update(node).await?;
        self.persist().await;
        Ok(())
    }

    async fn update_state(&self, id: &str, state: PowerState) -> Result<bool, StoreError> {
        let changed = self.inner.update_state(id, state).await?;
        if changed {
            self.persist().await;
        }
        Ok(changed)
    }

    async fn update_state_from(
        &self,
        id: &str,
        rule: StateRule,
    ) -> Result<Transition, StoreError> {
        let transition = self.inner.update_state_from(id, rule).await?;
        if transition.changed() {
            self.persist().await;
        }
        Ok(transition)
    }

    async fn append_action(&self, id: &str, action: Action) -> Result<(), StoreError> {
        self.inner.append_action(id, action).await?;
        self.persist().await;
        Ok(())
    }

    async fn get_system_info(&self, id: &str) -> Result<Option<SystemInfo>, StoreError> {
        self.inner.get_system_info(id).await
    }

    async fn set_system_info(&self, id: &str, info: SystemInfo) -> Result<(), StoreError> {
        self.inner.set_system_info(id, info).await?;
        self.persist().await;
        Ok(())
    }

    async fn modify(&self, id: &str, f: NodeMutation) -> Result<Node, StoreError> {
        let node = self.inner.modify(id, f).await?;
        self.persist().await;
        Ok(node)
    }
}
