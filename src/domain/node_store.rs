//! NodeStore: authoritative inventory of nodes.
//!
//! Every read hands out an owned copy and every write takes ownership of one,
//! so callers can never alias the store's records. Mutations of a single node
//! are atomic with respect to each other; "not found" is the only failure.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::node::Node;
use super::types::{Action, PowerState, SystemInfo};
use crate::error::StoreError;

/// Closure applied to a node under the store's lock.
pub type NodeMutation = Box<dyn FnOnce(&mut Node) + Send>;

/// Picks the next state from the one the store currently holds.
pub type StateRule = Box<dyn FnOnce(PowerState) -> PowerState + Send>;

/// Result of a rule-driven state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: PowerState,
    pub to: PowerState,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Node, StoreError>;

    async fn get_all(&self) -> Vec<Node>;

    /// Insert a node, replacing any record with the same ID.
    async fn add(&self, node: Node);

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Full replace, last writer wins.
    async fn update(&self, node: Node) -> Result<(), StoreError>;

    /// Set the current state and roll up duration counters. Returns whether
    /// the state actually changed.
    async fn update_state(&self, id: &str, state: PowerState) -> Result<bool, StoreError>;

    /// Like `update_state`, with the target computed from the stored state
    /// under the same lock.
    async fn update_state_from(&self, id: &str, rule: StateRule)
        -> Result<Transition, StoreError>;

    /// Append to the node's history, keeping only the most recent entries.
    async fn append_action(&self, id: &str, action: Action) -> Result<(), StoreError>;

    async fn get_system_info(&self, id: &str) -> Result<Option<SystemInfo>, StoreError>;

    async fn set_system_info(&self, id: &str, info: SystemInfo) -> Result<(), StoreError>;

    /// Atomic read-modify-write of one node. Returns the updated copy.
    async fn modify(&self, id: &str, f: NodeMutation) -> Result<Node, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<HashMap<String, Node>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let map = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        Self {
            nodes: RwLock::new(map),
        }
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Node, StoreError> {
        self.nodes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn get_all(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    async fn add(&self, node: Node) {
        self.nodes.write().await.insert(node.id.clone(), node);
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.nodes
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update(&self, node: Node) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(&node.id) {
            Some(slot) => {
                *slot = node;
                Ok(())
            }
            None => Err(StoreError::NotFound(node.id)),
        }
    }

    async fn update_state(&self, id: &str, state: PowerState) -> Result<bool, StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(node.transition(state, Utc::now()))
    }

    async fn update_state_from(
        &self,
        id: &str,
        rule: StateRule,
    ) -> Result<Transition, StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let from = node.current_state;
        let to = rule(from);
        node.transition(to, Utc::now());
        Ok(Transition { from, to })
    }

    async fn append_action(&self, id: &str, action: Action) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        node.push_action(action);
        Ok(())
    }

    async fn get_system_info(&self, id: &str) -> Result<Option<SystemInfo>, StoreError> {
        self.nodes
            .read()
            .await
            .get(id)
            .map(|n| n.system_info.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn set_system_info(&self, id: &str, info: SystemInfo) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        node.system_info = Some(info);
        Ok(())
    }

    async fn modify(&self, id: &str, f: NodeMutation) -> Result<Node, StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(node);
        Ok(node.clone())
    }
}
