//! Error types shared by graph building, forward evaluation and relevance propagation.
use crate::graph::NodeId;
use thiserror::Error;

/// Structural problems with an operation graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Cycle detected involving node {0:?}")]
    CycleDetected(NodeId),
    #[error("Graph has no output node")]
    MissingOutput,
    #[error("Graph has {0} output nodes, expected exactly one")]
    MultipleOutputs(usize),
    #[error("Graph has no input placeholder")]
    MissingInput,
    #[error("Reference to unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("Output is not reachable from input '{0}'")]
    OutputUnreachable(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelpropError {
    #[error("Unsupported operation '{op}' at node '{node_name}'")]
    UnsupportedOperation { node_id: NodeId, node_name: String, op: String },
    #[error("No captured activation for node '{node_name}'; run a forward evaluation before propagating")]
    StaleActivation { node_id: NodeId, node_name: String },
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { context: String, expected: Vec<usize>, actual: Vec<usize> },
    #[error("'{name}' expects {expected} input(s), got {actual}")]
    ArityMismatch { name: String, expected: usize, actual: usize },
    #[error("Forward evaluation failed at node '{node_name}': {source_error}")]
    Forward { node_id: NodeId, node_name: String, source_error: Box<RelpropError> },
    #[error("Operation graph was traced from a different model")]
    GraphMismatch,
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl RelpropError {
    pub(crate) fn shape(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        RelpropError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T, E = RelpropError> = std::result::Result<T, E>;
