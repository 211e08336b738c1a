//! A synchronous, single-threaded forward evaluator for traced models.
use super::{Model, TracedNode, TracedOp};
use crate::error::{RelpropError, Result};
use crate::graph::NodeId;
use crate::tensor::Tensor;
use smallvec::SmallVec;
use std::sync::Arc;

/// What the observer sees after each node has been evaluated.
#[derive(Debug)]
pub struct NodeEvaluation<'e> {
    pub node: NodeId,
    pub traced: &'e TracedNode,
    /// Argument values in call order.
    pub inputs: &'e [Arc<Tensor>],
    pub output: &'e Arc<Tensor>,
}

pub struct ForwardEngine<'a> {
    model: &'a Model,
}

impl<'a> ForwardEngine<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self { model }
    }

    /// Evaluates every node in program order and returns the output node's value.
    ///
    /// Nodes only reference earlier nodes, so program order is already a valid
    /// evaluation order. `observe` is called once per node, right after it is computed.
    pub fn run<F>(&self, inputs: &[Tensor], mut observe: F) -> Result<Arc<Tensor>>
    where
        F: FnMut(NodeEvaluation<'_>),
    {
        if inputs.len() != self.model.inputs().len() {
            return Err(RelpropError::ArityMismatch {
                name: "model inputs".to_string(),
                expected: self.model.inputs().len(),
                actual: inputs.len(),
            });
        }

        let mut values: Vec<Option<Arc<Tensor>>> = vec![None; self.model.nodes().len()];
        for (idx, traced) in self.model.nodes().iter().enumerate() {
            let node = NodeId::new(idx);

            // 1. Gather argument values. Arguments always precede their users.
            let mut args: SmallVec<[Arc<Tensor>; 2]> = SmallVec::with_capacity(traced.args.len());
            for &arg in &traced.args {
                let value = values
                    .get(arg.index())
                    .and_then(|v| v.clone())
                    .ok_or_else(|| self.wrap(node, traced, crate::error::TopologyError::UnknownNode(arg).into()))?;
                args.push(value);
            }

            // 2. Evaluate.
            let output = self.evaluate(traced, inputs, &args).map_err(|e| self.wrap(node, traced, e))?;

            // 3. Report and store.
            observe(NodeEvaluation { node, traced, inputs: &args, output: &output });
            values[idx] = Some(output);
        }

        values
            .get(self.model.output().index())
            .and_then(|v| v.clone())
            .ok_or_else(|| crate::error::TopologyError::MissingOutput.into())
    }

    fn evaluate(&self, traced: &TracedNode, inputs: &[Tensor], args: &[Arc<Tensor>]) -> Result<Arc<Tensor>> {
        match &traced.op {
            TracedOp::Input { index } => inputs
                .get(*index)
                .map(|t| Arc::new(t.clone()))
                .ok_or_else(|| RelpropError::ArityMismatch { name: traced.name.clone(), expected: index + 1, actual: inputs.len() }),
            TracedOp::CallLayer(layer_id) => {
                let named = self
                    .model
                    .layer(*layer_id)
                    .ok_or_else(|| RelpropError::Config(format!("unknown layer {:?}", layer_id)))?;
                let x = Self::single(traced, args)?;
                Ok(Arc::new(named.layer.forward(x)?))
            }
            TracedOp::CallFunction(op) => {
                let refs: SmallVec<[&Tensor; 2]> = args.iter().map(|a| a.as_ref()).collect();
                Ok(Arc::new(op.apply(&refs)?))
            }
            // The output node forwards its single argument unchanged.
            TracedOp::Output => Ok(Self::single(traced, args).map(|_| args[0].clone())?),
        }
    }

    fn single<'t>(traced: &TracedNode, args: &'t [Arc<Tensor>]) -> Result<&'t Tensor> {
        match args {
            [x] => Ok(x.as_ref()),
            _ => Err(RelpropError::ArityMismatch { name: traced.name.clone(), expected: 1, actual: args.len() }),
        }
    }

    fn wrap(&self, node: NodeId, traced: &TracedNode, error: RelpropError) -> RelpropError {
        RelpropError::Forward { node_id: node, node_name: traced.name.clone(), source_error: Box::new(error) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;
    use crate::model::{FunctionOp, Layer, ModelBuilder};
    use ndarray::array;

    #[test]
    fn test_observer_sees_every_node_in_order() {
        let model = fixtures::merge_model();
        let mut seen = Vec::new();
        let out = ForwardEngine::new(&model)
            .run(&[array![1.0f32].into_dyn()], |eval| seen.push((eval.node.index(), eval.inputs.len())))
            .unwrap();
        assert_eq!(*out, array![5.0f32].into_dyn());
        assert_eq!(seen, vec![(0, 0), (1, 1), (2, 1), (3, 2), (4, 1)]);
    }

    #[test]
    fn test_output_shares_the_final_value() {
        let model = fixtures::chain_model();
        let mut last = None;
        let out = ForwardEngine::new(&model)
            .run(&[array![2.0f32, 3.0].into_dyn()], |eval| {
                if eval.node.index() == 1 {
                    last = Some(eval.output.clone());
                }
            })
            .unwrap();
        assert!(Arc::ptr_eq(&out, &last.unwrap()));
    }

    #[test]
    fn test_errors_name_the_failing_node() {
        let mut b = ModelBuilder::new();
        let x = b.input("x");
        let fc = b.layer("fc", Layer::linear(array![[1.0, 1.0, 1.0]], None), x).unwrap();
        let flat = b.call("flatten", FunctionOp::Flatten { start_dim: 0 }, &[fc]).unwrap();
        b.output(flat).unwrap();
        let model = b.build().unwrap();

        let err = model.forward(&array![1.0f32, 2.0].into_dyn()).unwrap_err();
        match err {
            RelpropError::Forward { node_name, source_error, .. } => {
                assert_eq!(node_name, "fc");
                assert!(matches!(*source_error, RelpropError::ShapeMismatch { .. }));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_rejects_wrong_input_count() {
        let model = fixtures::chain_model();
        assert!(matches!(model.forward_inputs(&[]), Err(RelpropError::ArityMismatch { .. })));
    }
}
