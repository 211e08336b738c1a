use crate::error::TopologyError;
use crate::graph::{NodeId, OperationGraph};
use petgraph::Direction;
use std::collections::{HashSet, VecDeque};

/// Performs a Topological Sort using Depth-First Search (DFS).
///
/// Returns a list of NodeIds where every producer appears before its consumers.
/// The walk keeps its own stack, so depth is bounded by heap rather than call stack.
pub fn sort(graph: &OperationGraph) -> Result<Vec<NodeId>, TopologyError> {
    let ids = graph.node_ids();
    let bound = ids.last().map(|id| id.index() + 1).unwrap_or(0);
    let mut order = Vec::with_capacity(ids.len());
    let mut state = vec![VisitState::None; bound];

    // Every node is a start point so disconnected pieces are ordered too.
    for &start in &ids {
        if state[start.index()] == VisitState::None {
            visit(start, graph, &mut state, &mut order)?;
        }
    }

    Ok(order)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    None,
    Visiting, // Used for cycle detection
    Visited,
}

fn visit(
    start: NodeId,
    graph: &OperationGraph,
    state: &mut [VisitState],
    order: &mut Vec<NodeId>,
) -> Result<(), TopologyError> {
    // Each frame is a node plus its not-yet-visited producers.
    let mut stack: Vec<(NodeId, Vec<NodeId>)> = Vec::new();
    state[start.index()] = VisitState::Visiting;
    stack.push((start, producers(graph, start)));

    while let Some((node, pending)) = stack.last_mut() {
        match pending.pop() {
            Some(parent) => match state[parent.index()] {
                VisitState::Visited => {}
                VisitState::Visiting => return Err(TopologyError::CycleDetected(parent)),
                VisitState::None => {
                    state[parent.index()] = VisitState::Visiting;
                    let next = producers(graph, parent);
                    stack.push((parent, next));
                }
            },
            None => {
                let done = *node;
                state[done.index()] = VisitState::Visited;
                order.push(done);
                stack.pop();
            }
        }
    }
    Ok(())
}

/// Distinct producers, highest id first so that popping visits them in ascending order.
fn producers(graph: &OperationGraph, node: NodeId) -> Vec<NodeId> {
    let mut parents: Vec<NodeId> = graph.graph.neighbors_directed(node, Direction::Incoming).collect();
    parents.sort_unstable_by(|a, b| b.cmp(a));
    parents.dedup();
    parents
}

fn reachable(graph: &OperationGraph, start_nodes: &[NodeId], dir: Direction) -> HashSet<NodeId> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from(start_nodes.to_vec());

    while let Some(node) = queue.pop_front() {
        if visited.insert(node) {
            queue.extend(graph.graph.neighbors_directed(node, dir));
        }
    }
    visited
}

/// Identifies all nodes downstream from the given start nodes (inclusive).
pub fn downstream_from(graph: &OperationGraph, start_nodes: &[NodeId]) -> HashSet<NodeId> {
    reachable(graph, start_nodes, Direction::Outgoing)
}

/// Identifies all nodes the given start nodes depend on (inclusive).
pub fn upstream_from(graph: &OperationGraph, start_nodes: &[NodeId]) -> HashSet<NodeId> {
    reachable(graph, start_nodes, Direction::Incoming)
}

/// Nodes with a path to the output. Relevance only ever flows through these.
pub fn live_nodes(graph: &OperationGraph) -> Result<HashSet<NodeId>, TopologyError> {
    Ok(upstream_from(graph, &[graph.output()?]))
}
