//! Defines the `OperationNode` and its associated types, representing a single
//! traced operation of the model.

use crate::model::{LayerId, LayerType, OpCode};
use petgraph::graph::NodeIndex;
use smallvec::SmallVec;
use std::fmt;

/// A unique, stable identifier for a node within the graph.
///
/// This is a type alias for `petgraph::graph::NodeIndex` to abstract the
/// underlying graph implementation. Graph nodes share their index with the
/// traced model node they mirror.
pub type NodeId = NodeIndex;

/// The categorical role of a node, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A model input. Its relevance is the final attribution.
    Placeholder,
    /// A call of a stateful layer.
    Module,
    /// A call of a stateless operation.
    Function,
    /// The terminal sink holding the model prediction.
    Output,
}

/// How a Function node is identified.
///
/// `code` is the direct identity of a built-in operation. For user operations known
/// only by a call descriptor, `builtin_name` holds the canonical name recovered from
/// that descriptor when the graph was traced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    pub code: Option<OpCode>,
    pub builtin_name: Option<String>,
    pub descriptor: String,
}

/// The concrete operation bound to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    None,
    Layer { id: LayerId, layer_type: LayerType },
    Function(FunctionRef),
}

impl Method {
    /// Short operation label used in errors and traces.
    pub fn label(&self) -> String {
        match self {
            Method::None => String::new(),
            Method::Layer { layer_type, .. } => layer_type.name().to_string(),
            Method::Function(f) => match (f.code, &f.builtin_name) {
                (Some(code), _) => code.name().to_string(),
                (None, Some(name)) => name.clone(),
                (None, None) => f.descriptor.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationNode {
    pub name: String,
    pub kind: NodeKind,
    pub method: Method,
    // The list of input nodes in call order. The order is significant for
    // multi-input operations; the same node may appear more than once.
    pub inputs: SmallVec<[NodeId; 2]>,
}

impl fmt::Display for OperationNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NodeKind::Placeholder => write!(f, "{} [input]", self.name),
            NodeKind::Output => write!(f, "{} [output]", self.name),
            _ => write!(f, "{} [{}]", self.name, self.method.label()),
        }
    }
}
