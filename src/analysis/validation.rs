//! Static checks on a traced graph, run before any evaluation.
use super::topology;
use crate::error::TopologyError;
use crate::graph::{NodeId, NodeKind, OperationGraph};
use crate::rules::registry;

/// The specific category of a validation issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssueType {
    /// The graph cannot be propagated at all.
    Structure,
    /// A node on a path to the output has no registered rule.
    UnsupportedOperation,
    /// A node whose value never reaches the output. Propagation ignores it.
    DeadEnd,
}

/// A structured report from the static checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub node_id: Option<NodeId>,
    pub node_name: String,
    pub issue_type: ValidationIssueType,
    pub message: String,
}

impl ValidationIssue {
    /// Dead ends are informational; everything else blocks propagation.
    pub fn is_blocking(&self) -> bool {
        self.issue_type != ValidationIssueType::DeadEnd
    }
}

/// Collects every problem in the graph instead of stopping at the first one.
pub struct Validator<'a> {
    graph: &'a OperationGraph,
}

impl<'a> Validator<'a> {
    pub fn new(graph: &'a OperationGraph) -> Self {
        Self { graph }
    }

    /// The conditions without which no propagation can run: exactly one output,
    /// an acyclic graph and a primary input with a path to the output.
    pub fn structural(&self) -> Result<(), TopologyError> {
        self.graph.output()?;
        let root = self.graph.root()?;
        topology::sort(self.graph)?;
        if !topology::live_nodes(self.graph)?.contains(&root) {
            return Err(TopologyError::OutputUnreachable(self.graph.name(root)));
        }
        Ok(())
    }

    /// All issues, blocking or not, in ascending node order.
    pub fn report(&self) -> Vec<ValidationIssue> {
        if let Err(e) = self.structural() {
            return vec![ValidationIssue {
                node_id: None,
                node_name: String::new(),
                issue_type: ValidationIssueType::Structure,
                message: e.to_string(),
            }];
        }
        let live = match topology::live_nodes(self.graph) {
            Ok(live) => live,
            Err(e) => {
                return vec![ValidationIssue {
                    node_id: None,
                    node_name: String::new(),
                    issue_type: ValidationIssueType::Structure,
                    message: e.to_string(),
                }]
            }
        };

        let mut issues = Vec::new();
        for id in self.graph.node_ids() {
            let Some(node) = self.graph.node(id) else { continue };
            if !live.contains(&id) {
                issues.push(ValidationIssue {
                    node_id: Some(id),
                    node_name: node.name.clone(),
                    issue_type: ValidationIssueType::DeadEnd,
                    message: format!("'{}' does not contribute to the output", node.name),
                });
                continue;
            }
            if node.kind != NodeKind::Placeholder && registry::rule_for_node(node).is_none() {
                issues.push(ValidationIssue {
                    node_id: Some(id),
                    node_name: node.name.clone(),
                    issue_type: ValidationIssueType::UnsupportedOperation,
                    message: format!("no relevance rule for '{}'", node.method.label()),
                });
            }
        }
        issues
    }

    /// # Returns
    /// - `Ok(())` if nothing blocks propagation.
    /// - `Err(Vec<ValidationIssue>)` with every blocking issue found.
    pub fn validate(&self) -> Result<(), Vec<ValidationIssue>> {
        let errors: Vec<_> = self.report().into_iter().filter(ValidationIssue::is_blocking).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_graph;
    use crate::model::{fixtures, CustomOp, FunctionOp, Layer, ModelBuilder};
    use ndarray::array;

    #[test]
    fn test_supported_models_validate() {
        for model in [fixtures::chain_model(), fixtures::merge_model(), fixtures::residual_mlp()] {
            let graph = build_graph(&model);
            assert_eq!(Validator::new(&graph).validate(), Ok(()));
        }
    }

    #[test]
    fn test_collects_unsupported_and_dead_nodes() {
        let mut b = ModelBuilder::new();
        let x = b.input("x");
        let dead = b.layer("probe", Layer::linear(array![[1.0]], None), x).unwrap();
        let squash = b.layer("squash", Layer::Tanh, x).unwrap();
        let cube = CustomOp::new("<built-in function pow>", 1, |a| Ok(a[0].mapv(|v| v * v * v)));
        let y = b.call("cube", FunctionOp::Custom(cube), &[squash]).unwrap();
        b.output(y).unwrap();
        let graph = build_graph(&b.build().unwrap());

        let report = Validator::new(&graph).report();
        let kinds: Vec<_> = report.iter().map(|i| (i.node_name.as_str(), i.issue_type.clone())).collect();
        assert_eq!(
            kinds,
            vec![
                ("probe", ValidationIssueType::DeadEnd),
                ("squash", ValidationIssueType::UnsupportedOperation),
                ("cube", ValidationIssueType::UnsupportedOperation),
            ]
        );
        assert_eq!(report[0].node_id, Some(dead));

        let blocking = Validator::new(&graph).validate().unwrap_err();
        assert_eq!(blocking.len(), 2);
    }

    #[test]
    fn test_structural_failure_is_a_single_issue() {
        let mut b = ModelBuilder::new();
        let _x = b.input("x");
        let y = b.input("y");
        b.output(y).unwrap();
        let graph = build_graph(&b.build().unwrap());

        let issues = Validator::new(&graph).validate().unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, ValidationIssueType::Structure);
        assert!(matches!(Validator::new(&graph).structural(), Err(TopologyError::OutputUnreachable(_))));
    }
}
