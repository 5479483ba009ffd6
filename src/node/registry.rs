//! Node registry
//!
//! Nodes are stored in registration order, which is also the order the
//! scheduler scans them in. The downstream index (upstream key to consuming
//! nodes) is derived from the node inputs and rebuilt lazily after any
//! topology change.

use super::{Input, InputSource, Node, NodeKey};
use crate::asset::AssetId;
use crate::engine::RemoteNodeId;
use crate::error::{CookError, Result};
use std::collections::HashMap;

/// Owns every registered node
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Vec<Node>,
    next_key: u32,
    /// Rebuilt on demand, `None` when stale
    downstream: Option<HashMap<NodeKey, Vec<NodeKey>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return its key. Names are not required to be unique.
    pub fn register(&mut self, name: impl Into<String>, asset: AssetId) -> NodeKey {
        let key = NodeKey(self.next_key);
        self.next_key += 1;
        self.nodes.push(Node::new(key, name, asset));
        self.downstream = None;
        key
    }

    /// Remove a node. Inputs of other nodes that referenced it are left bound
    /// and resolve as unregistered upstreams.
    pub fn unregister(&mut self, key: NodeKey) -> Option<Node> {
        let pos = self.nodes.iter().position(|n| n.key == key)?;
        self.downstream = None;
        Some(self.nodes.remove(pos))
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.iter().find(|n| n.key == key)
    }

    pub fn get_mut(&mut self, key: NodeKey) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.key == key)
    }

    /// Like [`NodeRegistry::get`] but returns [`CookError::NodeNotFound`]
    pub fn node(&self, key: NodeKey) -> Result<&Node> {
        self.get(key).ok_or(CookError::NodeNotFound(key))
    }

    /// Like [`NodeRegistry::get_mut`] but returns [`CookError::NodeNotFound`]
    pub fn node_mut(&mut self, key: NodeKey) -> Result<&mut Node> {
        self.get_mut(key).ok_or(CookError::NodeNotFound(key))
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeKey> {
        self.nodes.iter().find(|n| n.name == name).map(|n| n.key)
    }

    /// Node owning the remote instantiation `remote`
    pub fn find_by_remote(&self, remote: RemoteNodeId) -> Option<NodeKey> {
        if !remote.is_valid() {
            return None;
        }
        self.nodes
            .iter()
            .find(|n| n.remote_id == remote || n.geo_id == remote)
            .map(|n| n.key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    pub fn keys(&self) -> Vec<NodeKey> {
        self.nodes.iter().map(|n| n.key).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// First node with a pending cook request, in registration order
    pub fn first_needing_cook(&self) -> Option<NodeKey> {
        self.nodes.iter().find(|n| n.needs_cook()).map(|n| n.key)
    }

    /// Forget the remote resources of every node
    pub fn invalidate_all(&mut self) {
        for node in &mut self.nodes {
            node.invalidate();
        }
    }

    /// Inputs changed somewhere; rebuild the downstream index on next use
    pub fn mark_topology_dirty(&mut self) {
        self.downstream = None;
    }

    /// Nodes with a node-typed input bound to `upstream`, in registration order
    pub fn downstream_of(&mut self, upstream: NodeKey) -> Vec<NodeKey> {
        if self.downstream.is_none() {
            self.downstream = Some(self.build_downstream_index());
        }
        self.downstream
            .as_ref()
            .and_then(|index| index.get(&upstream))
            .cloned()
            .unwrap_or_default()
    }

    fn build_downstream_index(&self) -> HashMap<NodeKey, Vec<NodeKey>> {
        let mut index: HashMap<NodeKey, Vec<NodeKey>> = HashMap::new();
        for node in &self.nodes {
            for upstream in node.upstream_keys() {
                let consumers = index.entry(upstream).or_default();
                if !consumers.contains(&node.key) {
                    consumers.push(node.key);
                }
            }
        }
        tracing::trace!("Rebuilt downstream index for {} nodes", self.nodes.len());
        index
    }

    /// Add an input slot to a node
    pub fn add_input(&mut self, key: NodeKey, input: Input) -> bool {
        let Some(node) = self.get_mut(key) else {
            return false;
        };
        node.inputs.push(input);
        self.downstream = None;
        true
    }

    /// Bind `source` to the input named `input_name`.
    ///
    /// Inputs are only known once the node is instantiated. Until then, or
    /// while the node exposes no input of that name, the binding is kept
    /// pending and applied after the next instantiation.
    ///
    /// Returns `Ok(false)` when the source was already bound.
    pub fn bind_input(&mut self, key: NodeKey, input_name: &str, source: InputSource) -> Result<bool> {
        let node = self.node_mut(key)?;
        let changed = match node.find_input(input_name) {
            Some(index) => node.inputs[index].bind(source),
            None if node.pending_bindings.get(input_name) == Some(&source) => false,
            None => {
                tracing::debug!("{}: binding for '{}' kept pending", node.label, input_name);
                node.pending_bindings.insert(input_name.to_string(), source);
                true
            }
        };
        if changed {
            self.downstream = None;
        }
        Ok(changed)
    }
}
