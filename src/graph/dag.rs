//! dag.rs
//! The operation graph: a petgraph `StableDiGraph` of traced operations plus the
//! bookkeeping needed by the interceptor and the relevance driver.

use super::edge::Edge;
use super::node::{NodeId, NodeKind, OperationNode};
use crate::error::TopologyError;
use crate::model::ModelId;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;

#[derive(Debug, Clone)]
pub struct OperationGraph {
    model_id: ModelId,
    pub(crate) graph: StableDiGraph<OperationNode, Edge>,
    placeholders: Vec<NodeId>,
    outputs: Vec<NodeId>,
}

impl OperationGraph {
    pub fn new(model_id: ModelId) -> Self {
        Self { model_id, graph: StableDiGraph::new(), placeholders: Vec::new(), outputs: Vec::new() }
    }

    /// Adds a node together with one edge per input slot.
    pub fn add_node(&mut self, node: OperationNode) -> Result<NodeId, TopologyError> {
        for &input in &node.inputs {
            if !self.graph.contains_node(input) {
                return Err(TopologyError::UnknownNode(input));
            }
        }
        let kind = node.kind;
        let inputs = node.inputs.clone();
        let id = self.graph.add_node(node);
        for (slot, input) in inputs.into_iter().enumerate() {
            self.graph.add_edge(input, id, Edge { slot: slot as u32 });
        }
        match kind {
            NodeKind::Placeholder => self.placeholders.push(id),
            NodeKind::Output => self.outputs.push(id),
            _ => {}
        }
        Ok(id)
    }

    // --- Accessors ---
    #[inline(always)]
    pub fn model_id(&self) -> ModelId { self.model_id }
    #[inline(always)]
    pub fn node(&self, id: NodeId) -> Option<&OperationNode> { self.graph.node_weight(id) }
    pub fn node_count(&self) -> usize { self.graph.node_count() }
    pub fn placeholders(&self) -> &[NodeId] { &self.placeholders }
    pub fn outputs(&self) -> &[NodeId] { &self.outputs }

    /// All node ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.graph.node_indices().collect();
        ids.sort_unstable();
        ids
    }

    pub fn name(&self, id: NodeId) -> String {
        self.node(id).map(|n| n.name.clone()).unwrap_or_else(|| format!("#{}", id.index()))
    }

    /// The primary input.
    pub fn root(&self) -> Result<NodeId, TopologyError> {
        self.placeholders.first().copied().ok_or(TopologyError::MissingInput)
    }

    /// The single designated output node.
    pub fn output(&self) -> Result<NodeId, TopologyError> {
        match self.outputs.as_slice() {
            [id] => Ok(*id),
            [] => Err(TopologyError::MissingOutput),
            many => Err(TopologyError::MultipleOutputs(many.len())),
        }
    }

    /// Producers of `id` in slot order, repeated when a producer fills several slots.
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        let mut slots: Vec<(u32, NodeId)> = self
            .graph
            .edges_directed(id, Direction::Incoming)
            .map(|e| (e.weight().slot, e.source()))
            .collect();
        slots.sort_unstable();
        slots.into_iter().map(|(_, n)| n).collect()
    }

    /// Distinct consumers of `id` in ascending order.
    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self.graph.neighbors_directed(id, Direction::Outgoing).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// The slots of `consumer` that are filled by `producer`.
    pub fn slots_between(&self, producer: NodeId, consumer: NodeId) -> Vec<usize> {
        let mut slots: Vec<usize> = self
            .graph
            .edges_connecting(producer, consumer)
            .map(|e| e.weight().slot as usize)
            .collect();
        slots.sort_unstable();
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::Method;
    use crate::model::fixtures;
    use smallvec::smallvec;

    fn make_node(name: &str, kind: NodeKind, inputs: &[NodeId]) -> OperationNode {
        OperationNode { name: name.into(), kind, method: Method::None, inputs: inputs.iter().copied().collect() }
    }

    #[test]
    fn test_predecessors_keep_slot_order_and_repeats() {
        let mut g = OperationGraph::new(fixtures::chain_model().id());
        let a = g.add_node(make_node("a", NodeKind::Placeholder, &[])).unwrap();
        let b = g.add_node(make_node("b", NodeKind::Module, &[a])).unwrap();
        let c = g.add_node(make_node("c", NodeKind::Function, &[b, a])).unwrap();
        let d = g.add_node(make_node("d", NodeKind::Function, &[a, a])).unwrap();

        assert_eq!(g.predecessors(c), vec![b, a]);
        assert_eq!(g.predecessors(d), vec![a, a]);
        assert_eq!(g.successors(a), vec![b, c, d]);
        assert_eq!(g.slots_between(a, d), vec![0, 1]);
        assert_eq!(g.slots_between(a, c), vec![1]);
    }

    #[test]
    fn test_output_must_be_unique() {
        let mut g = OperationGraph::new(fixtures::chain_model().id());
        assert_eq!(g.output(), Err(TopologyError::MissingOutput));
        assert_eq!(g.root(), Err(TopologyError::MissingInput));
        let a = g.add_node(make_node("a", NodeKind::Placeholder, &[])).unwrap();
        g.add_node(make_node("o1", NodeKind::Output, &[a])).unwrap();
        g.add_node(make_node("o2", NodeKind::Output, &[a])).unwrap();
        assert_eq!(g.output(), Err(TopologyError::MultipleOutputs(2)));
        assert_eq!(g.root(), Ok(a));
    }

    #[test]
    fn test_add_node_rejects_unknown_inputs() {
        let mut g = OperationGraph::new(fixtures::chain_model().id());
        let node = OperationNode {
            name: "x".into(),
            kind: NodeKind::Module,
            method: Method::None,
            inputs: smallvec![NodeId::new(3)],
        };
        assert_eq!(g.add_node(node), Err(TopologyError::UnknownNode(NodeId::new(3))));
    }
}
