//! Static Node Registry
//!
//! `NodeRegistry` over a mutable in-process table. The bundled binary seeds
//! it from the cluster file; tests flip liveness directly.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use crate::domain::ports::NodeRegistry;
use crate::model::{NodeId, NodeInfo, PoolId};

#[derive(Debug, Default)]
pub struct StaticNodeRegistry {
    nodes: RwLock<HashMap<NodeId, NodeInfo>>,
}

impl StaticNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: impl IntoIterator<Item = NodeInfo>) -> Self {
        let registry = Self::new();
        for node in nodes {
            registry.upsert(node);
        }
        registry
    }

    /// Insert or replace a node.
    pub fn upsert(&self, node: NodeInfo) {
        self.nodes.write().insert(node.id.clone(), node);
    }

    /// Flip the online flag of a node. Returns the previous value, or `None`
    /// for an unknown node.
    pub fn set_online(&self, id: &NodeId, online: bool) -> Option<bool> {
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(id)?;
        let previous = node.online;
        node.online = online;
        if online {
            node.heartbeat = Utc::now();
        }
        Some(previous)
    }

    /// Record a heartbeat for a node.
    pub fn heartbeat(&self, id: &NodeId) -> bool {
        match self.nodes.write().get_mut(id) {
            Some(node) => {
                node.heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &NodeId) -> Option<NodeInfo> {
        self.nodes.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl NodeRegistry for StaticNodeRegistry {
    fn node(&self, id: &NodeId) -> Option<NodeInfo> {
        self.nodes.read().get(id).cloned()
    }

    fn nodes_in_pool(&self, pool: &PoolId) -> Vec<NodeInfo> {
        let mut nodes: Vec<_> = self
            .nodes
            .read()
            .values()
            .filter(|n| &n.pool_id == pool)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    fn all_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }
}
