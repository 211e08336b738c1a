//! A propagation session: one model, its operation graph, the attached rules and
//! the activations captured by the latest forward evaluation.
//!
//! The forward/backward pair is driven through `&mut self`, so one session runs one
//! evaluation at a time. Independent attributions in parallel use one session each
//! (see [`crate::batch`]).
pub mod attribution;
pub mod driver;
pub mod interceptor;
pub mod ledger;

pub use attribution::{Attribution, AttributionSummary, SeedRelevance};
pub use driver::{Propagation, PropagationTrace, Propagator, TraceEntry};
pub use interceptor::{Interceptor, RuleBook};
pub use ledger::ActivationLedger;

use crate::analysis::validation::Validator;
use crate::config::PropagationConfig;
use crate::error::{RelpropError, Result};
use crate::graph::{build_graph, OperationGraph};
use crate::model::{ForwardEngine, Model, TracedOp};
use crate::tensor::Tensor;
use std::sync::Arc;
use tracing::debug;

pub struct RapSession<'m> {
    model: &'m Model,
    graph: Arc<OperationGraph>,
    rules: RuleBook<'m>,
    ledger: ActivationLedger,
    config: PropagationConfig,
    last_trace: Option<PropagationTrace>,
}

impl<'m> RapSession<'m> {
    /// Traces `model` and attaches rules to its layers.
    pub fn new(model: &'m Model, config: PropagationConfig) -> Result<Self> {
        Self::with_graph(model, Arc::new(build_graph(model)), config)
    }

    /// Reuses a graph traced earlier from the same model.
    pub fn with_graph(model: &'m Model, graph: Arc<OperationGraph>, config: PropagationConfig) -> Result<Self> {
        config.validate()?;
        if graph.model_id() != model.id() {
            return Err(RelpropError::GraphMismatch);
        }
        Validator::new(&graph).structural()?;

        let mut session = Self {
            model,
            graph,
            rules: RuleBook::new(),
            ledger: ActivationLedger::new(),
            config,
            last_trace: None,
        };
        session.attach_rules();
        Ok(session)
    }

    /// Attaches rules to layers that have none. Safe to call repeatedly.
    pub fn attach_rules(&mut self) -> usize {
        Interceptor::new(&self.graph, self.model, &self.config).attach(&mut self.rules)
    }

    pub fn model(&self) -> &'m Model { self.model }
    pub fn graph(&self) -> &Arc<OperationGraph> { &self.graph }
    pub fn config(&self) -> &PropagationConfig { &self.config }
    pub fn rules(&self) -> &RuleBook<'m> { &self.rules }
    pub fn ledger(&self) -> &ActivationLedger { &self.ledger }
    /// The trace of the latest propagation, when tracing is enabled.
    pub fn trace(&self) -> Option<&PropagationTrace> { self.last_trace.as_ref() }

    pub fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.forward_inputs(std::slice::from_ref(input))
    }

    /// Evaluates the model and captures the activations the next propagation uses.
    ///
    /// Inputs, functions and the output are captured directly; layers only through
    /// their attached rule.
    pub fn forward_inputs(&mut self, inputs: &[Tensor]) -> Result<Tensor> {
        let generation = self.ledger.begin_evaluation();
        self.ledger.ensure_capacity(self.graph.node_count());
        self.last_trace = None;

        let Self { model, rules, ledger, .. } = self;
        let result = ForwardEngine::new(*model).run(inputs, |eval| match &eval.traced.op {
            TracedOp::CallLayer(layer) => {
                if let Some(rule) = rules.get(*layer) {
                    rule.forward_capture(&eval, ledger);
                }
            }
            _ => ledger.record(eval.node, Arc::clone(eval.output)),
        });

        match result {
            Ok(output) => {
                debug!(generation, captured = self.ledger.captured(), "forward evaluation captured");
                Ok(Arc::try_unwrap(output).unwrap_or_else(|shared| (*shared).clone()))
            }
            Err(e) => {
                // A failed evaluation leaves nothing to propagate from.
                self.ledger.invalidate(self.graph.node_ids());
                Err(e)
            }
        }
    }

    /// Propagates `seed` (shaped like the prediction) back to the primary input.
    pub fn relprop(&mut self, seed: &Tensor) -> Result<Tensor> {
        let mut attributions = self.relprop_inputs(seed)?;
        Ok(attributions.swap_remove(0))
    }

    /// Propagates `seed` back to every input, in input order.
    pub fn relprop_inputs(&mut self, seed: &Tensor) -> Result<Vec<Tensor>> {
        let propagation = Propagator::new(&self.graph, &self.rules, &self.ledger, &self.config).run(seed)?;
        self.last_trace = propagation.trace;
        Ok(propagation.attributions)
    }

    /// Forward evaluation followed by propagation from the chosen seed.
    pub fn attribute(&mut self, input: &Tensor, seed: &SeedRelevance) -> Result<Attribution> {
        let prediction = self.forward(input)?;
        let (seed, classes) = seed.resolve(&prediction)?;
        let values = self.relprop(&seed)?;
        Ok(Attribution { values, seed, prediction, classes })
    }
}
