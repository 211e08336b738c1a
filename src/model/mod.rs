//! The traced model: an ordered program of inputs, layer calls, function calls and
//! one output, each referring to earlier nodes by id.
//!
//! Arguments may only reference nodes that already exist, so every `Model` is a DAG
//! by construction. Layers live in a table separate from the call sites, which lets
//! one layer be invoked at several nodes.
pub mod executor;
pub mod function;
pub mod layer;

pub use executor::{ForwardEngine, NodeEvaluation};
pub use function::{CustomOp, FunctionOp, OpCode};
pub use layer::{BatchNorm2d, Conv2d, Layer, LayerType, Linear};

use crate::error::{RelpropError, Result, TopologyError};
use crate::graph::NodeId;
use crate::tensor::Tensor;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a built model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u32);

impl LayerId {
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub enum TracedOp {
    /// The `index`-th model input.
    Input { index: usize },
    CallLayer(LayerId),
    CallFunction(FunctionOp),
    Output,
}

#[derive(Debug, Clone)]
pub struct TracedNode {
    pub name: String,
    pub op: TracedOp,
    /// Arguments in call order. The order is significant for multi-input operations.
    pub args: SmallVec<[NodeId; 2]>,
}

#[derive(Debug, Clone)]
pub struct NamedLayer {
    pub name: String,
    pub layer: Layer,
}

#[derive(Debug, Clone)]
pub struct Model {
    id: ModelId,
    layers: Vec<NamedLayer>,
    nodes: Vec<TracedNode>,
    inputs: Vec<NodeId>,
    output: NodeId,
}

impl Model {
    pub fn id(&self) -> ModelId { self.id }
    pub fn nodes(&self) -> &[TracedNode] { &self.nodes }
    pub fn node(&self, id: NodeId) -> Option<&TracedNode> { self.nodes.get(id.index()) }
    pub fn layers(&self) -> &[NamedLayer] { &self.layers }
    pub fn layer(&self, id: LayerId) -> Option<&NamedLayer> { self.layers.get(id.index()) }
    pub fn inputs(&self) -> &[NodeId] { &self.inputs }
    pub fn output(&self) -> NodeId { self.output }

    /// Evaluates a single-input model.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.forward_inputs(std::slice::from_ref(input))
    }

    pub fn forward_inputs(&self, inputs: &[Tensor]) -> Result<Tensor> {
        let out = ForwardEngine::new(self).run(inputs, |_| {})?;
        Ok(std::sync::Arc::try_unwrap(out).unwrap_or_else(|shared| (*shared).clone()))
    }
}

/// Records a model node by node.
#[derive(Debug, Default)]
pub struct ModelBuilder {
    layers: Vec<NamedLayer>,
    nodes: Vec<TracedNode>,
    inputs: Vec<NodeId>,
    output: Option<NodeId>,
    used_names: HashSet<String>,
}

impl ModelBuilder {
    pub fn new() -> Self { Self::default() }

    /// Makes `name` unique among node names by appending `_1`, `_2`, ...
    fn unique_name(&mut self, name: &str) -> String {
        let mut candidate = name.to_string();
        let mut counter = 1;
        while self.used_names.contains(&candidate) {
            candidate = format!("{}_{}", name, counter);
            counter += 1;
        }
        self.used_names.insert(candidate.clone());
        candidate
    }

    fn push(&mut self, name: &str, op: TracedOp, args: &[NodeId]) -> Result<NodeId> {
        for &arg in args {
            match self.nodes.get(arg.index()) {
                None => return Err(TopologyError::UnknownNode(arg).into()),
                Some(TracedNode { op: TracedOp::Output, .. }) => {
                    return Err(RelpropError::Config(format!("output node {:?} cannot be used as an argument", arg)))
                }
                Some(_) => {}
            }
        }
        let id = NodeId::new(self.nodes.len());
        let name = self.unique_name(name);
        self.nodes.push(TracedNode { name, op, args: SmallVec::from_slice(args) });
        Ok(id)
    }

    pub fn input(&mut self, name: &str) -> NodeId {
        let index = self.inputs.len();
        let id = NodeId::new(self.nodes.len());
        let name = self.unique_name(name);
        self.nodes.push(TracedNode { name, op: TracedOp::Input { index }, args: SmallVec::new() });
        self.inputs.push(id);
        id
    }

    /// Registers a layer without calling it.
    pub fn add_layer(&mut self, name: &str, layer: Layer) -> LayerId {
        let id = LayerId(self.layers.len() as u32);
        self.layers.push(NamedLayer { name: name.to_string(), layer });
        id
    }

    pub fn call_layer(&mut self, name: &str, layer: LayerId, arg: NodeId) -> Result<NodeId> {
        if layer.index() >= self.layers.len() {
            return Err(RelpropError::Config(format!("unknown layer {:?}", layer)));
        }
        self.push(name, TracedOp::CallLayer(layer), &[arg])
    }

    /// Registers `layer` and calls it once on `arg`.
    pub fn layer(&mut self, name: &str, layer: Layer, arg: NodeId) -> Result<NodeId> {
        let id = self.add_layer(name, layer);
        self.call_layer(name, id, arg)
    }

    /// Applies each layer in turn, one node per layer.
    pub fn chain<'n>(&mut self, layers: impl IntoIterator<Item = (&'n str, Layer)>, arg: NodeId) -> Result<NodeId> {
        layers.into_iter().try_fold(arg, |prev, (name, layer)| self.layer(name, layer, prev))
    }

    pub fn call(&mut self, name: &str, op: FunctionOp, args: &[NodeId]) -> Result<NodeId> {
        if args.len() != op.arity() {
            return Err(RelpropError::ArityMismatch { name: name.to_string(), expected: op.arity(), actual: args.len() });
        }
        self.push(name, TracedOp::CallFunction(op), args)
    }

    pub fn output(&mut self, node: NodeId) -> Result<NodeId> {
        if self.output.is_some() {
            return Err(TopologyError::MultipleOutputs(2).into());
        }
        let id = self.push("output", TracedOp::Output, &[node])?;
        self.output = Some(id);
        Ok(id)
    }

    pub fn build(self) -> Result<Model> {
        if self.inputs.is_empty() {
            return Err(TopologyError::MissingInput.into());
        }
        let output = self.output.ok_or(TopologyError::MissingOutput)?;
        Ok(Model {
            id: ModelId(NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed)),
            layers: self.layers,
            nodes: self.nodes,
            inputs: self.inputs,
            output,
        })
    }
}

/// Small models shared by tests across the crate.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use ndarray::array;

    /// `x -> Linear([[1, 1]], bias 0) -> output`.
    pub fn chain_model() -> Model {
        let mut b = ModelBuilder::new();
        let x = b.input("x");
        let fc = b.layer("fc", Layer::linear(array![[1.0, 1.0]], Some(array![0.0])), x).unwrap();
        b.output(fc).unwrap();
        b.build().unwrap()
    }

    /// `x -> a = Linear([[2]]), b = Linear([[3]]) -> add(a, b) -> output`.
    pub fn merge_model() -> Model {
        let mut b = ModelBuilder::new();
        let x = b.input("x");
        let left = b.layer("left", Layer::linear(array![[2.0]], None), x).unwrap();
        let right = b.layer("right", Layer::linear(array![[3.0]], None), x).unwrap();
        let sum = b.call("add", FunctionOp::Add, &[left, right]).unwrap();
        b.output(sum).unwrap();
        b.build().unwrap()
    }

    /// A small positive-weight MLP with a skip connection:
    /// `x -> fc1 -> relu -> fc2 -> add(fc2, relu) -> fc3 -> output`.
    pub fn residual_mlp() -> Model {
        let mut b = ModelBuilder::new();
        let x = b.input("x");
        let fc1 = b
            .layer("fc1", Layer::linear(array![[0.5, 0.2, 0.1], [0.3, 0.4, 0.9]], Some(array![0.0, 0.0])), x)
            .unwrap();
        let act = b.layer("relu", Layer::ReLU, fc1).unwrap();
        let fc2 = b.layer("fc2", Layer::linear(array![[1.0, 0.5], [0.25, 2.0]], None), act).unwrap();
        let skip = b.call("add", FunctionOp::Add, &[fc2, act]).unwrap();
        let fc3 = b.layer("fc3", Layer::linear(array![[0.7, 0.1], [0.2, 0.6], [0.4, 0.4]], None), skip).unwrap();
        b.output(fc3).unwrap();
        b.build().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_builder_rejects_unknown_argument() {
        let mut b = ModelBuilder::new();
        b.input("x");
        let err = b.layer("fc", Layer::ReLU, NodeId::new(7)).unwrap_err();
        assert_eq!(err, RelpropError::Topology(TopologyError::UnknownNode(NodeId::new(7))));
    }

    #[test]
    fn test_builder_requires_output_and_input() {
        let mut b = ModelBuilder::new();
        b.input("x");
        assert_eq!(b.build().unwrap_err(), RelpropError::Topology(TopologyError::MissingOutput));
        assert_eq!(ModelBuilder::new().build().unwrap_err(), RelpropError::Topology(TopologyError::MissingInput));
    }

    #[test]
    fn test_builder_checks_function_arity() {
        let mut b = ModelBuilder::new();
        let x = b.input("x");
        assert!(matches!(b.call("add", FunctionOp::Add, &[x]), Err(RelpropError::ArityMismatch { .. })));
    }

    #[test]
    fn test_node_names_are_made_unique() {
        let mut b = ModelBuilder::new();
        let x = b.input("x");
        let a = b.layer("relu", Layer::ReLU, x).unwrap();
        let c = b.layer("relu", Layer::ReLU, a).unwrap();
        b.output(c).unwrap();
        let model = b.build().unwrap();
        assert_eq!(model.node(a).unwrap().name, "relu");
        assert_eq!(model.node(c).unwrap().name, "relu_1");
    }

    #[test]
    fn test_shared_layer_called_twice() {
        let mut b = ModelBuilder::new();
        let x = b.input("x");
        let shared = b.add_layer("double", Layer::linear(array![[2.0]], None));
        let h1 = b.call_layer("double", shared, x).unwrap();
        let h2 = b.call_layer("double", shared, h1).unwrap();
        b.output(h2).unwrap();
        let model = b.build().unwrap();
        assert_eq!(model.layers().len(), 1);
        assert_eq!(model.forward(&array![1.5f32].into_dyn()).unwrap(), array![6.0f32].into_dyn());
    }

    #[test]
    fn test_models_get_distinct_ids() {
        assert_ne!(fixtures::chain_model().id(), fixtures::chain_model().id());
    }
}
