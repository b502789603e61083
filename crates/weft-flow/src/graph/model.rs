use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};
use weft_core::traits::{GraphView, NodeSpec};
use weft_core::types::{NodeId, NodeRecord};

use super::node::Node;
use super::validator::{self, DependencyGraph};

/// The flow graph: prompt nodes and the dependency edges between them.
///
/// Nodes keep their insertion order. Edges live in each node's `depends_on`
/// and can only be added through [`FlowGraph::add_dependency`], which keeps
/// the graph acyclic.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    order: Vec<NodeId>,
    nodes: HashMap<NodeId, Node>,
}

/// On-disk shape of a flow.
#[derive(Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    nodes: Vec<Node>,
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    nodes: Vec<&'a Node>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node at `(x, y)` and return its id.
    pub fn add_node(&mut self, x: f64, y: f64) -> NodeId {
        let node = Node::new(NodeId::new()).at(x, y);
        let id = node.id.clone();
        self.order.push(id.clone());
        self.nodes.insert(id.clone(), node);
        debug!(node_id = %id, "Node added");
        id
    }

    /// Insert a fully-formed node.
    ///
    /// Its dependencies must already be present, so nodes are inserted in
    /// dependency order.
    pub fn insert_node(&mut self, node: Node) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(WeftError::DuplicateNode(node.id.to_string()));
        }
        for dep in &node.depends_on {
            if *dep == node.id {
                return Err(WeftError::SelfConnection(dep.to_string()));
            }
            if !self.nodes.contains_key(dep) {
                return Err(WeftError::NodeNotFound(dep.to_string()));
            }
        }
        let mut node = node;
        dedup_in_order(&mut node.depends_on);
        self.insert_unchecked(node);
        Ok(())
    }

    fn insert_unchecked(&mut self, node: Node) {
        self.order.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
    }

    /// Remove a node and strip it from every other node's dependencies.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        let removed = self.nodes.remove(id)?;
        self.order.retain(|n| n != id);
        for node in self.nodes.values_mut() {
            node.depends_on.retain(|d| d != id);
        }
        debug!(node_id = %id, "Node removed");
        Some(removed)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// All nodes, in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Every edge as a `(source, target)` pair, where `target` depends on `source`.
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.nodes()
            .flat_map(|n| n.depends_on.iter().map(|d| (d.clone(), n.id.clone())))
            .collect()
    }

    fn node_mut(&mut self, id: &NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| WeftError::NodeNotFound(id.to_string()))
    }

    pub fn set_position(&mut self, id: &NodeId, x: f64, y: f64) -> Result<()> {
        let node = self.node_mut(id)?;
        node.x = x;
        node.y = y;
        Ok(())
    }

    pub fn set_size(&mut self, id: &NodeId, w: f64, h: f64) -> Result<()> {
        let node = self.node_mut(id)?;
        node.w = w;
        node.h = h;
        Ok(())
    }

    pub fn set_system_prompt(&mut self, id: &NodeId, text: impl Into<String>) -> Result<()> {
        self.node_mut(id)?.system_prompt = text.into();
        Ok(())
    }

    pub fn set_input(&mut self, id: &NodeId, text: impl Into<String>) -> Result<()> {
        self.node_mut(id)?.input = text.into();
        Ok(())
    }

    /// Make `target` depend on `source`.
    ///
    /// Rejected connections leave the graph unchanged. Adding an edge that
    /// already exists is a no-op.
    pub fn add_dependency(&mut self, target: &NodeId, source: &NodeId) -> Result<()> {
        validator::check_connection(self, source, target)?;

        let node = self.node_mut(target)?;
        if !node.depends_on.contains(source) {
            node.depends_on.push(source.clone());
            debug!(source = %source, target = %target, "Dependency added");
        }
        Ok(())
    }

    /// Remove the edge `source -> target`. Returns whether it existed.
    pub fn remove_dependency(&mut self, target: &NodeId, source: &NodeId) -> bool {
        match self.nodes.get_mut(target) {
            Some(node) => {
                let before = node.depends_on.len();
                node.depends_on.retain(|d| d != source);
                node.depends_on.len() != before
            }
            None => false,
        }
    }

    /// Clear status, output, and error on every node.
    pub fn reset_execution_state(&mut self) {
        for node in self.nodes.values_mut() {
            node.reset_execution_state();
        }
    }

    /// Copy a run's terminal record onto a node, if it still exists.
    pub fn apply_record(&mut self, id: &NodeId, record: &NodeRecord) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.apply_record(record);
                true
            }
            None => false,
        }
    }

    /// Serialize to the persisted JSON document.
    pub fn serialize(&self) -> String {
        let doc = DocumentRef {
            nodes: self.nodes().collect(),
        };
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string(&doc).unwrap_or_else(|_| String::from(r#"{"nodes":[]}"#))
    }

    /// Parse a persisted document, checking every graph invariant.
    pub fn try_deserialize(text: &str) -> Result<Self> {
        let doc: Document =
            serde_json::from_str(text).map_err(|e| WeftError::Serialization(e.to_string()))?;

        let mut graph = Self::new();
        for node in doc.nodes {
            if graph.contains(&node.id) {
                return Err(WeftError::Serialization(
                    WeftError::DuplicateNode(node.id.to_string()).to_string(),
                ));
            }
            graph.insert_unchecked(node);
        }

        validator::check_integrity(&graph).map_err(|e| WeftError::Serialization(e.to_string()))?;
        for node in graph.nodes.values_mut() {
            dedup_in_order(&mut node.depends_on);
        }
        Ok(graph)
    }

    /// Parse a persisted document, falling back to an empty graph.
    pub fn deserialize(text: &str) -> Self {
        match Self::try_deserialize(text) {
            Ok(graph) => graph,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable flow document");
                Self::default()
            }
        }
    }
}

fn dedup_in_order(ids: &mut Vec<NodeId>) {
    let mut seen = std::collections::HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
}

impl DependencyGraph for FlowGraph {
    fn has_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    fn dependencies_of(&self, id: &NodeId) -> Option<&[NodeId]> {
        self.nodes.get(id).map(|n| n.depends_on.as_slice())
    }

    fn all_ids(&self) -> Vec<&NodeId> {
        self.order.iter().collect()
    }
}

impl GraphView for FlowGraph {
    fn node_ids(&self) -> Vec<NodeId> {
        self.order.clone()
    }

    fn node_spec(&self, id: &NodeId) -> Option<NodeSpec> {
        self.nodes.get(id).map(Node::spec)
    }
}
