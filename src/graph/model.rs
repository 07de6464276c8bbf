//! Flow graph arena.
//!
//! Nodes and edges live in id-keyed maps; nothing holds a reference to anything
//! else, and adjacency is derived from the edge map whenever it is asked for.
//! Ids are never reused, so iteration order is creation order.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::model::{ReferenceImage, Step, StepSettings};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EdgeId(u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Editor canvas position. Layout only; never read by the runners.
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone)]
pub struct FlowNode {
    id: NodeId,
    name: String,
    step: Step,
    position: Position,
}

impl FlowNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Unique within its graph; the identifier persisted on disk.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn image(&self) -> &ReferenceImage {
        &self.step.image
    }

    pub fn settings(&self) -> &StepSettings {
        &self.step.settings
    }

    pub fn position(&self) -> Position {
        self.position
    }
}

/// `from` executes, then `to`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Edge {
    pub id: EdgeId,
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("unknown edge {0}")]
    UnknownEdge(EdgeId),

    #[error("a node named '{0}' already exists")]
    DuplicateName(String),

    #[error("node {0} cannot be connected to itself")]
    SelfLoop(NodeId),

    #[error("nodes {from} and {to} are already connected")]
    DuplicateEdge { from: NodeId, to: NodeId },
}

/// Steps (nodes) joined by "then" edges.
///
/// Invariants upheld by every mutation:
/// - each edge references two nodes present in the graph,
/// - no edge starts and ends at the same node,
/// - at most one edge per ordered node pair,
/// - node names are unique.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    nodes: BTreeMap<NodeId, FlowNode>,
    edges: BTreeMap<EdgeId, Edge>,
    next_node: u32,
    next_edge: u32,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        image: ReferenceImage,
        settings: StepSettings,
        position: Position,
    ) -> Result<NodeId, GraphError> {
        let name = name.into();
        if self.node_by_name(&name).is_some() {
            return Err(GraphError::DuplicateName(name));
        }
        let id = NodeId(self.next_node);
        self.next_node += 1;
        trace!(target: "clickflow::graph", %id, %name, "Node added");
        self.nodes.insert(
            id,
            FlowNode {
                id,
                name,
                step: Step::new(image, settings),
                position,
            },
        );
        Ok(id)
    }

    /// Remove a node together with every edge touching it.
    pub fn remove_node(&mut self, id: NodeId) -> Result<FlowNode, GraphError> {
        let node = self.nodes.remove(&id).ok_or(GraphError::UnknownNode(id))?;
        self.edges.retain(|_, edge| edge.from != id && edge.to != id);
        trace!(target: "clickflow::graph", %id, name = %node.name, "Node removed");
        Ok(node)
    }

    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<EdgeId, GraphError> {
        self.require(from)?;
        self.require(to)?;
        if from == to {
            return Err(GraphError::SelfLoop(from));
        }
        if self.edges.values().any(|e| e.from == from && e.to == to) {
            return Err(GraphError::DuplicateEdge { from, to });
        }
        let id = EdgeId(self.next_edge);
        self.next_edge += 1;
        self.edges.insert(id, Edge { id, from, to });
        trace!(target: "clickflow::graph", %id, %from, %to, "Nodes connected");
        Ok(id)
    }

    pub fn disconnect(&mut self, id: EdgeId) -> Result<Edge, GraphError> {
        self.edges.remove(&id).ok_or(GraphError::UnknownEdge(id))
    }

    pub fn move_node(&mut self, id: NodeId, position: Position) -> Result<(), GraphError> {
        self.node_mut(id)?.position = position;
        Ok(())
    }

    pub fn set_settings(&mut self, id: NodeId, settings: StepSettings) -> Result<(), GraphError> {
        self.node_mut(id)?.step.settings = settings;
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&FlowNode> {
        self.nodes.get(&id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&FlowNode> {
        self.nodes.values().find(|n| n.name == name)
    }

    /// Nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.values()
    }

    /// Edges in creation order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    /// Targets of `id`'s outgoing edges, in edge creation order.
    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        self.edges
            .values()
            .filter(|e| e.from == id)
            .map(|e| e.to)
            .collect()
    }

    /// Origins of `id`'s incoming edges, in edge creation order.
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        self.edges
            .values()
            .filter(|e| e.to == id)
            .map(|e| e.from)
            .collect()
    }

    pub fn incident_edges(&self, id: NodeId) -> Vec<EdgeId> {
        self.edges
            .values()
            .filter(|e| e.from == id || e.to == id)
            .map(|e| e.id)
            .collect()
    }

    /// Drop every node and edge. Ids keep counting up.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
    }

    fn require(&self, id: NodeId) -> Result<(), GraphError> {
        if self.nodes.contains_key(&id) {
            Ok(())
        } else {
            Err(GraphError::UnknownNode(id))
        }
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut FlowNode, GraphError> {
        self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::add;
    use super::*;

    #[test]
    fn names_are_unique() {
        let mut graph = FlowGraph::new();
        add(&mut graph, "a.png");
        let image = ReferenceImage::from_path("a.png", "detect/a.png");
        assert_eq!(
            graph.add_node("a.png", image, StepSettings::default(), Position::default()),
            Err(GraphError::DuplicateName("a.png".into()))
        );
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn connect_rejects_bad_edges() {
        let mut graph = FlowGraph::new();
        let a = add(&mut graph, "a");
        let b = add(&mut graph, "b");

        assert_eq!(graph.connect(a, a), Err(GraphError::SelfLoop(a)));
        graph.connect(a, b).unwrap();
        assert_eq!(
            graph.connect(a, b),
            Err(GraphError::DuplicateEdge { from: a, to: b })
        );
        // The reverse direction is a different edge.
        graph.connect(b, a).unwrap();

        graph.remove_node(b).unwrap();
        assert_eq!(graph.connect(a, b), Err(GraphError::UnknownNode(b)));
    }

    #[test]
    fn removing_a_node_cascades_to_its_edges() {
        let mut graph = FlowGraph::new();
        let a = add(&mut graph, "a");
        let b = add(&mut graph, "b");
        let c = add(&mut graph, "c");
        graph.connect(a, b).unwrap();
        let bc = graph.connect(b, c).unwrap();
        let ac = graph.connect(a, c).unwrap();

        graph.remove_node(b).unwrap();
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.edge(bc).is_none());
        assert_eq!(graph.incident_edges(c), vec![ac]);
        assert!(graph.edges().all(|e| graph.node(e.from).is_some() && graph.node(e.to).is_some()));
    }

    #[test]
    fn adjacency_follows_edge_creation_order() {
        let mut graph = FlowGraph::new();
        let a = add(&mut graph, "a");
        let b = add(&mut graph, "b");
        let c = add(&mut graph, "c");
        graph.connect(a, c).unwrap();
        graph.connect(a, b).unwrap();
        graph.connect(b, c).unwrap();

        assert_eq!(graph.successors(a), vec![c, b]);
        assert_eq!(graph.predecessors(c), vec![a, b]);
        assert!(graph.successors(c).is_empty());
    }

    #[test]
    fn disconnect_and_edit() {
        let mut graph = FlowGraph::new();
        let a = add(&mut graph, "a");
        let b = add(&mut graph, "b");
        let edge = graph.connect(a, b).unwrap();

        assert_eq!(graph.disconnect(edge).unwrap().to, b);
        assert_eq!(graph.disconnect(edge), Err(GraphError::UnknownEdge(edge)));

        graph.move_node(a, Position::new(12.5, -3.0)).unwrap();
        graph
            .set_settings(b, StepSettings::default().with_timeout(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(graph.node(a).unwrap().position(), Position::new(12.5, -3.0));
        assert_eq!(graph.node(b).unwrap().settings().search_timeout, Duration::from_secs(5));
        assert_eq!(graph.node_by_name("b").map(FlowNode::id), Some(b));
    }

    #[test]
    fn clear_never_reuses_ids() {
        let mut graph = FlowGraph::new();
        let first = add(&mut graph, "a");
        graph.clear();
        assert!(graph.is_empty());
        let second = add(&mut graph, "a");
        assert_ne!(first, second);
    }
}
