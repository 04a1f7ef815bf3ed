//! Parent/child relationships between nodes. The parent links must form a
//! forest; walking a chain rejects cycles instead of looping.

use std::collections::HashSet;

use super::node::Node;
use super::node_store::NodeStore;
use crate::error::{EngineError, EngineResult, StoreError, TopologyError};

/// Follow `parent_id` links from `id` to the root of its tree.
pub async fn resolve_root(store: &dyn NodeStore, id: &str) -> EngineResult<Node> {
    let mut visited = HashSet::new();
    let mut current = store.get(id).await?;
    loop {
        if !visited.insert(current.id.clone()) {
            return Err(TopologyError::Cycle(current.id).into());
        }
        let Some(parent_id) = current.parent_id.clone() else {
            return Ok(current);
        };
        current = match store.get(&parent_id).await {
            Ok(parent) => parent,
            Err(StoreError::NotFound(_)) => {
                return Err(TopologyError::ParentNotFound {
                    node: current.id,
                    parent: parent_id,
                }
                .into())
            }
            Err(e) => return Err(EngineError::Store(e)),
        };
    }
}

/// The hypervisor host of a guest: its direct parent, which must be a
/// hypervisor host carrying valid management credentials.
pub async fn guest_host(store: &dyn NodeStore, guest: &Node) -> EngineResult<Node> {
    let parent_id = guest
        .parent_id
        .clone()
        .ok_or_else(|| TopologyError::NoParent(guest.id.clone()))?;
    let parent = store.get(&parent_id).await.map_err(|_| TopologyError::ParentNotFound {
        node: guest.id.clone(),
        parent: parent_id.clone(),
    })?;
    match parent.host_api() {
        Some(api) if api.has_valid_credentials() => Ok(parent),
        _ => Err(TopologyError::InvalidHost {
            node: guest.id.clone(),
            parent: parent_id,
        }
        .into()),
    }
}
