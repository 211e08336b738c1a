//! Traces a `Model` into an `OperationGraph`.
//!
//! Tracing never checks rule coverage. A graph with unsupported operations builds
//! fine; the driver reports them only when a propagation actually visits them.
use super::dag::OperationGraph;
use super::node::{FunctionRef, Method, NodeKind, OperationNode};
use crate::model::{FunctionOp, Model, TracedNode, TracedOp};
use crate::rules::registry;
use tracing::debug;

pub struct GraphBuilder<'a> {
    model: &'a Model,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self { model }
    }

    pub fn trace(&self) -> OperationGraph {
        let mut graph = OperationGraph::new(self.model.id());
        for traced in self.model.nodes() {
            let node = self.classify(traced);
            // Model arguments always reference earlier nodes, which were added with the same index.
            if let Err(e) = graph.add_node(node) {
                debug!(node = %traced.name, error = %e, "skipping node with dangling input");
            }
        }
        debug!(
            model = ?self.model.id(),
            nodes = graph.node_count(),
            inputs = graph.placeholders().len(),
            "traced operation graph"
        );
        graph
    }

    fn classify(&self, traced: &TracedNode) -> OperationNode {
        let (kind, method) = match &traced.op {
            TracedOp::Input { .. } => (NodeKind::Placeholder, Method::None),
            TracedOp::Output => (NodeKind::Output, Method::None),
            TracedOp::CallLayer(id) => {
                let method = match self.model.layer(*id) {
                    Some(named) => Method::Layer { id: *id, layer_type: named.layer.layer_type() },
                    None => Method::None,
                };
                (NodeKind::Module, method)
            }
            TracedOp::CallFunction(op) => (NodeKind::Function, Method::Function(function_ref(op))),
        };
        OperationNode { name: traced.name.clone(), kind, method, inputs: traced.args.clone() }
    }
}

fn function_ref(op: &FunctionOp) -> FunctionRef {
    let descriptor = op.descriptor();
    let builtin_name = match op.code() {
        Some(_) => None,
        None => registry::canonical_name(&descriptor),
    };
    FunctionRef { code: op.code(), builtin_name, descriptor }
}

/// Traces `model` into a fresh operation graph.
pub fn build_graph(model: &Model) -> OperationGraph {
    GraphBuilder::new(model).trace()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;
    use crate::model::{CustomOp, Layer, LayerType, ModelBuilder, OpCode};
    use ndarray::array;

    #[test]
    fn test_chain_graph_shape() {
        let model = fixtures::chain_model();
        let g = build_graph(&model);
        let root = g.root().unwrap();
        let out = g.output().unwrap();
        assert_eq!(g.node_count(), 3);
        assert_eq!(g.node(root).unwrap().kind, NodeKind::Placeholder);
        assert_eq!(g.node(out).unwrap().kind, NodeKind::Output);
        assert!(g.successors(out).is_empty());

        let fc = g.successors(root)[0];
        let node = g.node(fc).unwrap();
        assert_eq!(node.kind, NodeKind::Module);
        assert!(matches!(node.method, Method::Layer { layer_type: LayerType::Linear, .. }));
        assert_eq!(g.predecessors(out), vec![fc]);
    }

    #[test]
    fn test_merge_graph_has_fan_out_and_fan_in() {
        let g = build_graph(&fixtures::merge_model());
        let root = g.root().unwrap();
        let branches = g.successors(root);
        assert_eq!(branches.len(), 2);
        let add = g.successors(branches[0])[0];
        assert_eq!(g.predecessors(add), branches);
        match &g.node(add).unwrap().method {
            Method::Function(f) => assert_eq!(f.code, Some(OpCode::Add)),
            other => panic!("unexpected method {:?}", other),
        }
    }

    #[test]
    fn test_custom_op_gets_canonical_name_at_trace_time() {
        let mut b = ModelBuilder::new();
        let x = b.input("x");
        let l = b.layer("l", Layer::linear(array![[2.0]], None), x).unwrap();
        let r = b.layer("r", Layer::linear(array![[3.0]], None), x).unwrap();
        let add = CustomOp::new("<built-in method add of type object at 0x7f3a>", 2, |a| Ok(a[0] + a[1]));
        let mul = CustomOp::new("<built-in function mul>", 2, |a| Ok(a[0] * a[1]));
        let s = b.call("sum", FunctionOp::Custom(add), &[l, r]).unwrap();
        let p = b.call("prod", FunctionOp::Custom(mul), &[s, r]).unwrap();
        b.output(p).unwrap();
        let model = b.build().unwrap();
        let g = build_graph(&model);

        let method = |id| match &g.node(id).unwrap().method {
            Method::Function(f) => f.clone(),
            other => panic!("unexpected method {:?}", other),
        };
        assert_eq!(method(s).code, None);
        assert_eq!(method(s).builtin_name.as_deref(), Some("add"));
        // Building tolerates operations no rule covers.
        assert_eq!(method(p).builtin_name.as_deref(), Some("mul"));
    }
}
