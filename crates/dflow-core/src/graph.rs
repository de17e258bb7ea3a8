//! The in-memory operation graph.
//!
//! [`OpGraph`] stores operation nodes in a petgraph `StableGraph` so node
//! ids stay valid across removals (identity is positional, never a pointer).
//! Wires are directed edges from producer to consumer carrying the port pair;
//! the producer's consumer list is simply its outgoing adjacency, so there is
//! no separately maintained back-edge list that could dangle.
//!
//! The single mutation invariant: **each input port has at most one incoming
//! wire**. [`OpGraph::connect`] removes the previous wire on the target port
//! before inserting the new one, atomically from the caller's perspective.
//!
//! A [`Circuit`] owns one or more graphs; graph 0 is the entry graph and
//! [`Call`](crate::ops::OpKind::Call) nodes invoke the others.

use petgraph::stable_graph::StableGraph;
use petgraph::visit::EdgeRef;
use petgraph::{Directed, Direction};
use serde::{Deserialize, Serialize};

use crate::error::{DflowError, Position};
use crate::id::{GraphId, NodeId};
use crate::ops::OpKind;

/// A wire from one node's output port to another node's input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEdge {
    /// Output port of the producing node (0 for single-output operators).
    pub source_port: u16,
    /// Input port of the consuming node.
    pub target_port: u16,
}

/// One operation instance: its operator, auxiliary argument strings from the
/// editor block, and the editor block index it was assembled from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpNode {
    pub op: OpKind,
    pub args: Vec<String>,
    /// Editor block index, carried for diagnostics positions.
    pub origin: u32,
}

impl OpNode {
    pub fn new(op: OpKind, args: Vec<String>, origin: u32) -> Self {
        OpNode { op, args, origin }
    }

    /// Diagnostic position for this node.
    pub fn position(&self, id: NodeId) -> Position {
        Position {
            block: Some(self.origin),
            node: Some(id),
            pin: None,
        }
    }
}

/// A single operation graph with one designated output node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpGraph {
    wires: StableGraph<OpNode, WireEdge, Directed, u32>,
    output: Option<NodeId>,
}

impl OpGraph {
    pub fn new() -> Self {
        OpGraph::default()
    }

    /// Adds a node. The first [`OpKind::Output`] becomes the designated
    /// output; a second one is rejected.
    pub fn add_node(
        &mut self,
        op: OpKind,
        args: Vec<String>,
        origin: u32,
    ) -> Result<NodeId, DflowError> {
        if matches!(op, OpKind::Output) && self.output.is_some() {
            return Err(DflowError::DuplicateOutput {
                at: Position::block(origin),
            });
        }
        let is_output = matches!(op, OpKind::Output);
        let idx = self.wires.add_node(OpNode::new(op, args, origin));
        let id = NodeId::from(idx);
        if is_output {
            self.output = Some(id);
        }
        Ok(id)
    }

    /// Connects input `port` of `node` to output `source_port` of `producer`,
    /// replacing any previous wire on that port.
    pub fn connect(
        &mut self,
        node: NodeId,
        port: u16,
        producer: NodeId,
        source_port: u16,
    ) -> Result<(), DflowError> {
        let target = self.node(node).ok_or(DflowError::NodeNotFound { id: node })?;
        let arity = target.op.arity();
        if port >= arity {
            return Err(DflowError::InvalidPin {
                pin: port,
                arity,
                at: Position {
                    block: Some(target.origin),
                    node: Some(node),
                    pin: Some(port),
                },
            });
        }
        if self.node(producer).is_none() {
            return Err(DflowError::NodeNotFound { id: producer });
        }
        self.disconnect(node, port)?;
        self.wires.add_edge(
            producer.into(),
            node.into(),
            WireEdge {
                source_port,
                target_port: port,
            },
        );
        #[cfg(debug_assertions)]
        self.assert_single_producer(node);
        Ok(())
    }

    /// Disconnects input `port` of `node`, if wired.
    pub fn disconnect(&mut self, node: NodeId, port: u16) -> Result<(), DflowError> {
        if self.node(node).is_none() {
            return Err(DflowError::NodeNotFound { id: node });
        }
        let existing = self
            .wires
            .edges_directed(node.into(), Direction::Incoming)
            .find(|e| e.weight().target_port == port)
            .map(|e| e.id());
        if let Some(edge) = existing {
            self.wires.remove_edge(edge);
        }
        Ok(())
    }

    /// Removes a node and every wire touching it.
    pub fn remove_node(&mut self, id: NodeId) -> Result<OpNode, DflowError> {
        let removed = self
            .wires
            .remove_node(id.into())
            .ok_or(DflowError::NodeNotFound { id })?;
        if self.output == Some(id) {
            self.output = None;
        }
        Ok(removed)
    }

    pub fn node(&self, id: NodeId) -> Option<&OpNode> {
        self.wires.node_weight(id.into())
    }

    /// The producing `(node, output port)` currently wired to input `port` of
    /// `node`, or `None` when unconnected.
    pub fn producer_of(&self, node: NodeId, port: u16) -> Option<(NodeId, u16)> {
        self.wires
            .edges_directed(node.into(), Direction::Incoming)
            .find(|e| e.weight().target_port == port)
            .map(|e| (NodeId::from(e.source()), e.weight().source_port))
    }

    /// Every `(consumer node, consumer input port)` reading from `node`.
    pub fn consumers_of(&self, node: NodeId) -> Vec<(NodeId, u16)> {
        self.wires
            .edges_directed(node.into(), Direction::Outgoing)
            .map(|e| (NodeId::from(e.target()), e.weight().target_port))
            .collect()
    }

    pub fn output(&self) -> Option<NodeId> {
        self.output
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.wires.node_indices().map(NodeId::from)
    }

    pub fn node_count(&self) -> usize {
        self.wires.node_count()
    }

    pub fn wire_count(&self) -> usize {
        self.wires.edge_count()
    }

    /// Number of declared input slots (`Input` nodes) of this graph.
    pub fn input_count(&self) -> u16 {
        self.node_ids()
            .filter_map(|id| match self.node(id).map(|n| &n.op) {
                Some(OpKind::Input { index }) => Some(*index + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    #[cfg(debug_assertions)]
    fn assert_single_producer(&self, node: NodeId) {
        let mut seen = std::collections::HashSet::new();
        for e in self.wires.edges_directed(node.into(), Direction::Incoming) {
            assert!(
                seen.insert(e.weight().target_port),
                "node {node} has two producers on port {}",
                e.weight().target_port
            );
        }
    }
}

/// A set of operation graphs. Graph 0 is the entry graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Circuit {
    graphs: Vec<OpGraph>,
}

impl Circuit {
    pub fn new() -> Self {
        Circuit::default()
    }

    pub fn add_graph(&mut self, graph: OpGraph) -> GraphId {
        let id = GraphId(self.graphs.len() as u32);
        self.graphs.push(graph);
        id
    }

    pub fn graph(&self, id: GraphId) -> Result<&OpGraph, DflowError> {
        self.graphs
            .get(id.0 as usize)
            .ok_or(DflowError::GraphNotFound { id })
    }

    pub fn graph_mut(&mut self, id: GraphId) -> Result<&mut OpGraph, DflowError> {
        self.graphs
            .get_mut(id.0 as usize)
            .ok_or(DflowError::GraphNotFound { id })
    }

    /// The entry graph.
    pub fn root(&self) -> &OpGraph {
        &self.graphs[0]
    }

    pub fn graph_count(&self) -> usize {
        self.graphs.len()
    }
}
