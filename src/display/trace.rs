//! Text rendering of a propagation trace: the tree of relevance flowing from the
//! output back to the inputs.
use crate::graph::{NodeId, NodeKind, OperationGraph};
use crate::session::PropagationTrace;
use crate::tensor::Tensor;
use std::collections::HashMap;
use std::fmt::Write;

pub fn format_trace(graph: &OperationGraph, trace: &PropagationTrace) -> String {
    let mut tracer = Tracer { graph, trace, visited_at_level: HashMap::new(), output: String::new() };

    match graph.output() {
        Ok(out) => {
            let _ = writeln!(tracer.output, "RELEVANCE TRACE for node '{}':", graph.name(out));
            let _ = writeln!(tracer.output, "--------------------------------------------------");
            tracer.trace_node(out, 1, "");
        }
        Err(e) => {
            let _ = writeln!(tracer.output, "Error: {}", e);
        }
    }
    tracer.output
}

struct Tracer<'a> {
    graph: &'a OperationGraph,
    trace: &'a PropagationTrace,
    visited_at_level: HashMap<NodeId, usize>,
    output: String,
}

impl<'a> Tracer<'a> {
    fn trace_node(&mut self, node_id: NodeId, level: usize, prefix: &str) {
        if let Some(&first_seen) = self.visited_at_level.get(&node_id) {
            let _ = writeln!(self.output, "{}-> (Ref to L{})", prefix, first_seen);
            return;
        }
        self.visited_at_level.insert(node_id, level);

        let Some(node) = self.graph.node(node_id) else {
            let _ = writeln!(self.output, "{}[L{}] #{} [missing]", prefix, level, node_id.index());
            return;
        };
        let Some(entry) = self.trace.get(node_id) else {
            // Not visited by the propagation (dead branch).
            let _ = writeln!(self.output, "{}[L{}] {} (no relevance)", prefix, level, node);
            return;
        };

        match node.kind {
            NodeKind::Placeholder => {
                let r = entry.upstream.first().map(Self::format_value).unwrap_or_else(|| "[?]".into());
                let _ = writeln!(self.output, "{}[L{}] {} ATTRIBUTION {}", prefix, level, node, r);
            }
            _ => {
                let slots: Vec<String> = entry.upstream.iter().map(Self::format_value).collect();
                let _ = writeln!(
                    self.output,
                    "{}[L{}] {} via {} -> {}",
                    prefix,
                    level,
                    node,
                    entry.rule,
                    slots.join(" | ")
                );
                let inputs = self.graph.predecessors(node_id);
                self.recurse_children(prefix, &inputs, level);
            }
        }
    }

    fn recurse_children(&mut self, prefix: &str, children: &[NodeId], level: usize) {
        let stem = self.build_child_stem(prefix);
        for (i, &child) in children.iter().enumerate() {
            let connector = if i == children.len() - 1 { "`--" } else { "|--" };
            let full_prefix = format!("{}{}", stem, connector);
            self.trace_node(child, level + 1, &full_prefix);
        }
    }

    /// Scalars print as-is; wider tensors as their total and element count.
    fn format_value(t: &Tensor) -> String {
        match t.len() {
            0 => "[]".to_string(),
            1 => format!("[{:.4}]", t.sum()),
            n => format!("[sum={:.4}, n={}]", t.sum(), n),
        }
    }

    fn build_child_stem(&self, current_prefix: &str) -> String {
        current_prefix.replace("`--", "   ").replace("|--", "|  ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PropagationConfig;
    use crate::model::{fixtures, Layer, ModelBuilder};
    use crate::session::RapSession;
    use ndarray::array;

    #[test]
    fn test_merge_trace_shows_both_branches_and_shared_input() {
        let model = fixtures::merge_model();
        let mut session = RapSession::new(&model, PropagationConfig::default().with_trace(true)).unwrap();
        session.forward(&array![1.0f32].into_dyn()).unwrap();
        session.relprop(&array![1.0f32].into_dyn()).unwrap();

        let text = format_trace(session.graph(), session.trace().unwrap());
        assert!(text.starts_with("RELEVANCE TRACE for node 'output':"), "{}", text);
        assert!(text.contains("[L2] add [add] via Add -> [0.4000] | [0.6000]"), "{}", text);
        assert!(text.contains("|--[L3] left [Linear] via Linear -> [0.4000]"), "{}", text);
        assert!(text.contains("ATTRIBUTION [1.0000]"), "{}", text);
        // The input is shared by both branches and printed once.
        assert!(text.contains("-> (Ref to L4)"), "{}", text);
    }

    #[test]
    fn test_chain_layout_indents_each_level() {
        let mut b = ModelBuilder::new();
        let x = b.input("x");
        let y = b.layer("fc", Layer::linear(array![[2.0]], None), x).unwrap();
        let _unused = b.layer("unused", Layer::linear(array![[1.0]], None), x).unwrap();
        b.output(y).unwrap();
        let model = b.build().unwrap();
        let mut session = RapSession::new(&model, PropagationConfig::default().with_trace(true)).unwrap();
        session.forward(&array![1.0f32].into_dyn()).unwrap();
        session.relprop(&array![1.0f32].into_dyn()).unwrap();

        let text = format_trace(session.graph(), session.trace().unwrap());
        assert!(text.contains("`--[L2] fc [Linear] via Linear -> [1.0000]"), "{}", text);
        assert!(text.contains("   `--[L3] x [input] ATTRIBUTION [1.0000]"), "{}", text);
        assert!(!text.contains("unused"), "{}", text);
    }
}
