//! The relevance propagation driver.
//!
//! For a node `N` with captured inputs `X_N` and rule `rule_N`, the relevance at
//! its inputs is
//!
//! `up(N) = sum over live successors M (ascending) of rule_N(branch(M, N), X_N)`
//!
//! where `branch(M, N)` sums the slots of `up(M)` that `N` fills. The output node
//! passes the seed through, and an input's attribution is its own `up`.
use super::interceptor::RuleBook;
use super::ledger::ActivationLedger;
use crate::analysis::topology;
use crate::config::{PropagationConfig, Traversal};
use crate::error::{RelpropError, Result, TopologyError};
use crate::graph::{Method, NodeId, NodeKind, OperationGraph};
use crate::rules::{registry, PassThrough, RelProp, Relevance};
use crate::tensor::{self, Tensor};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Relevance seen at one node during a propagation.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub rule: &'static str,
    /// Relevance handed to each input slot. Inputs and the output sink have one slot.
    pub upstream: Relevance,
}

/// Per-node relevance of one propagation, in ascending node order.
#[derive(Debug, Clone, Default)]
pub struct PropagationTrace {
    entries: BTreeMap<NodeId, TraceEntry>,
}

impl PropagationTrace {
    pub fn get(&self, node: NodeId) -> Option<&TraceEntry> {
        self.entries.get(&node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &TraceEntry)> {
        self.entries.iter().map(|(id, e)| (*id, e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The result of one propagation: one attribution per input, in input order.
#[derive(Debug, Clone)]
pub struct Propagation {
    pub attributions: Vec<Tensor>,
    pub trace: Option<PropagationTrace>,
}

enum RuleRef<'s, 'm> {
    Attached(&'s (dyn RelProp + 'm)),
    OnDemand(Box<dyn RelProp>),
}

impl RuleRef<'_, '_> {
    fn get(&self) -> &dyn RelProp {
        match self {
            RuleRef::Attached(rule) => *rule,
            RuleRef::OnDemand(rule) => rule.as_ref(),
        }
    }
}

/// Everything a traversal needs, resolved before any rule runs.
struct Plan<'s, 'm> {
    output: NodeId,
    live: HashSet<NodeId>,
    order: Vec<NodeId>,
    rules: HashMap<NodeId, RuleRef<'s, 'm>>,
    inputs: HashMap<NodeId, SmallVec<[Arc<Tensor>; 2]>>,
}

pub struct Propagator<'s, 'm> {
    graph: &'s OperationGraph,
    book: &'s RuleBook<'m>,
    ledger: &'s ActivationLedger,
    config: &'s PropagationConfig,
}

impl<'s, 'm> Propagator<'s, 'm> {
    pub fn new(
        graph: &'s OperationGraph,
        book: &'s RuleBook<'m>,
        ledger: &'s ActivationLedger,
        config: &'s PropagationConfig,
    ) -> Self {
        Self { graph, book, ledger, config }
    }

    /// Propagates `seed` from the output back to every input.
    ///
    /// Fails without a partial result if any node on a path to the output lacks a
    /// rule or a captured input.
    pub fn run(&self, seed: &Tensor) -> Result<Propagation> {
        let plan = self.preflight(seed)?;
        debug!(live = plan.live.len(), traversal = ?self.config.traversal, "propagating relevance");

        let mut upstream: HashMap<NodeId, Relevance> = HashMap::with_capacity(plan.live.len());
        match self.config.traversal {
            Traversal::Scheduled => self.run_scheduled(&plan, seed, &mut upstream)?,
            Traversal::Recursive => {
                for &input in self.graph.placeholders() {
                    if plan.live.contains(&input) {
                        self.run_recursive(&plan, seed, input, &mut upstream)?;
                    }
                }
            }
        }

        let mut attributions = Vec::with_capacity(self.graph.placeholders().len());
        for &input in self.graph.placeholders() {
            let value = match upstream.get(&input).and_then(|r| r.first()) {
                Some(r) => r.clone(),
                // Inputs with no path to the output receive nothing.
                None => self
                    .ledger
                    .get(input)
                    .map(|x| Tensor::zeros(x.raw_dim()))
                    .ok_or_else(|| self.stale(input))?,
            };
            attributions.push(value);
        }

        let trace = self.config.record_trace.then(|| PropagationTrace {
            entries: upstream
                .into_iter()
                .filter_map(|(id, up)| plan.rules.get(&id).map(|r| (id, TraceEntry { rule: r.get().name(), upstream: up })))
                .collect(),
        });
        debug!(inputs = attributions.len(), "relevance propagation finished");
        Ok(Propagation { attributions, trace })
    }

    fn preflight(&self, seed: &Tensor) -> Result<Plan<'s, 'm>> {
        // 1. Structure: one output, a root that reaches it, no cycles.
        let output = self.graph.output()?;
        let root = self.graph.root()?;
        let sorted = topology::sort(self.graph)?;
        let live = topology::live_nodes(self.graph)?;
        if !live.contains(&root) {
            return Err(TopologyError::OutputUnreachable(self.graph.name(root)).into());
        }
        let order: Vec<NodeId> = sorted.into_iter().filter(|id| live.contains(id)).collect();

        // 2. Every live node needs a rule.
        let mut rules = HashMap::with_capacity(order.len());
        for &id in &order {
            rules.insert(id, self.resolve(id)?);
        }

        // 3. Every live node needs captured inputs, and the seed must fit the prediction.
        let mut inputs = HashMap::with_capacity(order.len());
        for &id in &order {
            let captured = self
                .graph
                .predecessors(id)
                .into_iter()
                .map(|p| self.ledger.get(p).cloned().ok_or_else(|| self.stale(p)))
                .collect::<Result<SmallVec<[Arc<Tensor>; 2]>>>()?;
            inputs.insert(id, captured);
        }
        let prediction = self.ledger.get(output).ok_or_else(|| self.stale(output))?;
        tensor::ensure_same_shape("seed relevance", prediction, seed)?;

        Ok(Plan { output, live, order, rules, inputs })
    }

    fn resolve(&self, id: NodeId) -> Result<RuleRef<'s, 'm>> {
        let node = self.graph.node(id).ok_or(TopologyError::UnknownNode(id))?;
        let unsupported = || RelpropError::UnsupportedOperation {
            node_id: id,
            node_name: node.name.clone(),
            op: node.method.label(),
        };
        match (node.kind, &node.method) {
            (NodeKind::Placeholder | NodeKind::Output, _) => Ok(RuleRef::OnDemand(Box::new(PassThrough))),
            (NodeKind::Module, Method::Layer { id: layer, .. }) => {
                self.book.get(*layer).map(RuleRef::Attached).ok_or_else(unsupported)
            }
            (NodeKind::Function, _) => {
                let kind = registry::rule_for_node(node).ok_or_else(unsupported)?;
                Ok(RuleRef::OnDemand(kind.bind_function(self.config)?))
            }
            _ => Err(unsupported()),
        }
    }

    fn stale(&self, id: NodeId) -> RelpropError {
        RelpropError::StaleActivation { node_id: id, node_name: self.graph.name(id) }
    }

    /// Consumers first: by the time a node is reached all its live successors are done.
    fn run_scheduled(&self, plan: &Plan<'s, 'm>, seed: &Tensor, upstream: &mut HashMap<NodeId, Relevance>) -> Result<()> {
        for &id in plan.order.iter().rev() {
            let up = self.combine(plan, seed, id, upstream)?;
            upstream.insert(id, up);
        }
        Ok(())
    }

    /// Post-order recursion along successor edges, memoised per node.
    fn run_recursive(
        &self,
        plan: &Plan<'s, 'm>,
        seed: &Tensor,
        id: NodeId,
        upstream: &mut HashMap<NodeId, Relevance>,
    ) -> Result<()> {
        if upstream.contains_key(&id) {
            return Ok(());
        }
        for next in self.live_successors(plan, id) {
            self.run_recursive(plan, seed, next, upstream)?;
        }
        let up = self.combine(plan, seed, id, upstream)?;
        upstream.insert(id, up);
        Ok(())
    }

    fn live_successors(&self, plan: &Plan<'s, 'm>, id: NodeId) -> Vec<NodeId> {
        self.graph.successors(id).into_iter().filter(|s| plan.live.contains(s)).collect()
    }

    /// Applies the node's rule once per successor branch and sums the results.
    fn combine(&self, plan: &Plan<'s, 'm>, seed: &Tensor, id: NodeId, upstream: &HashMap<NodeId, Relevance>) -> Result<Relevance> {
        let rule = plan.rules.get(&id).ok_or_else(|| self.stale(id))?.get();
        let captured = plan.inputs.get(&id).ok_or_else(|| self.stale(id))?;
        let args: SmallVec<[&Tensor; 2]> = captured.iter().map(|a| a.as_ref()).collect();
        trace!(node = %self.graph.name(id), rule = rule.name(), "visiting node");

        if id == plan.output {
            return rule.relprop(seed, &args);
        }

        let mut total: Option<Relevance> = None;
        for next in self.live_successors(plan, id) {
            let branch = self.branch(id, next, upstream)?;
            let contribution = rule.relprop(&branch, &args)?;
            total = Some(match total {
                None => contribution,
                Some(mut acc) => {
                    if acc.len() != contribution.len() {
                        return Err(RelpropError::ArityMismatch {
                            name: rule.name().to_string(),
                            expected: acc.len(),
                            actual: contribution.len(),
                        });
                    }
                    for (a, c) in acc.iter_mut().zip(contribution.iter()) {
                        tensor::ensure_same_shape("branch relevance", a, c)?;
                        *a += c;
                    }
                    acc
                }
            });
        }
        // Live nodes other than the output always have a live successor.
        total.ok_or_else(|| TopologyError::OutputUnreachable(self.graph.name(id)).into())
    }

    /// The relevance `next` hands back to `id`: the sum of the slots `id` fills.
    fn branch(&self, id: NodeId, next: NodeId, upstream: &HashMap<NodeId, Relevance>) -> Result<Tensor> {
        let up = upstream.get(&next).ok_or_else(|| self.stale(next))?;
        let mut slots = self.graph.slots_between(id, next).into_iter();
        let pick = |slot: usize| {
            up.get(slot).ok_or_else(|| RelpropError::ArityMismatch {
                name: self.graph.name(next),
                expected: slot + 1,
                actual: up.len(),
            })
        };
        let first = slots.next().ok_or(TopologyError::UnknownNode(next))?;
        let mut sum = pick(first)?.clone();
        for slot in slots {
            let r = pick(slot)?;
            tensor::ensure_same_shape("slot relevance", &sum, r)?;
            sum += r;
        }
        Ok(sum)
    }
}
