//! Relevance-redistribution rules.
//!
//! A rule maps the relevance arriving at an operation's output, together with the
//! captured values of the operation's inputs, to one relevance tensor per input slot.
pub mod linear;
pub mod merge;
pub mod pointwise;
pub mod pooling;
pub mod registry;
pub mod sequential;

use crate::config::PropagationConfig;
use crate::error::{RelpropError, Result};
use crate::model::{Layer, NodeEvaluation};
use crate::session::ledger::ActivationLedger;
use crate::tensor::Tensor;
use smallvec::SmallVec;
use std::sync::Arc;

pub use linear::{Conv2dRule, LinearRule};
pub use merge::{AddRule, FlattenRule};
pub use pointwise::{BatchNormRule, PassThrough};
pub use pooling::PoolingRule;
pub use sequential::SequentialRule;

/// Upstream relevance, one tensor per input slot of the operation.
pub type Relevance = SmallVec<[Tensor; 2]>;

pub trait RelProp {
    fn name(&self) -> &'static str;

    /// Redistributes `relevance` (shaped like the operation's output) over `inputs`,
    /// the captured input values in slot order.
    fn relprop(&self, relevance: &Tensor, inputs: &[&Tensor]) -> Result<Relevance>;

    /// Called during a forward evaluation of the node this rule is attached to.
    /// The default keeps the node's output.
    fn forward_capture(&self, eval: &NodeEvaluation<'_>, ledger: &mut ActivationLedger) {
        ledger.record(eval.node, Arc::clone(eval.output));
    }
}

pub(crate) fn single_input<'t>(name: &str, inputs: &[&'t Tensor]) -> Result<&'t Tensor> {
    match inputs {
        [x] => Ok(*x),
        _ => Err(RelpropError::ArityMismatch { name: name.to_string(), expected: 1, actual: inputs.len() }),
    }
}

/// The family a rule belongs to. Registry tables map operation identity to one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    PassThrough,
    AlphaBeta,
    ZPool,
    BatchNorm,
    AddMerge,
    Flatten,
    Sequential,
}

impl RuleKind {
    /// Instantiates the rule for one layer instance.
    pub fn bind_layer<'m>(self, layer: &'m Layer, config: &PropagationConfig) -> Result<Box<dyn RelProp + 'm>> {
        let rule: Box<dyn RelProp + 'm> = match (self, layer) {
            (RuleKind::PassThrough, _) => Box::new(PassThrough),
            (RuleKind::AlphaBeta, Layer::Linear(l)) => Box::new(LinearRule::new(l, config.alpha)),
            (RuleKind::AlphaBeta, Layer::Conv2d(c)) => Box::new(Conv2dRule::new(c, config.alpha)),
            (RuleKind::ZPool, _) => match layer.pooling() {
                Some((window, mode)) => Box::new(PoolingRule::new(layer.layer_type().name(), window, mode)),
                None => return Err(self.mismatch(layer)),
            },
            (RuleKind::BatchNorm, Layer::BatchNorm2d(bn)) => Box::new(BatchNormRule::new(bn, config.stabilizer)),
            (RuleKind::Sequential, Layer::Sequential(children)) => Box::new(SequentialRule::new(children, config)?),
            _ => return Err(self.mismatch(layer)),
        };
        Ok(rule)
    }

    /// Instantiates a rule for a stateless operation.
    pub fn bind_function(self, config: &PropagationConfig) -> Result<Box<dyn RelProp>> {
        match self {
            RuleKind::AddMerge => Ok(Box::new(AddRule::new(config.add_split))),
            RuleKind::Flatten => Ok(Box::new(FlattenRule)),
            other => Err(RelpropError::Config(format!("{:?} rules need a layer", other))),
        }
    }

    fn mismatch(self, layer: &Layer) -> RelpropError {
        RelpropError::Config(format!("{:?} rule cannot bind a {} layer", self, layer.layer_type()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_bind_layer_checks_kind() {
        let config = PropagationConfig::default();
        let linear = Layer::linear(array![[1.0]], None);
        assert_eq!(RuleKind::AlphaBeta.bind_layer(&linear, &config).unwrap().name(), "Linear");
        assert!(RuleKind::BatchNorm.bind_layer(&linear, &config).is_err());
        assert!(RuleKind::ZPool.bind_layer(&Layer::ReLU, &config).is_err());

        let pool = Layer::MaxPool2d { kernel: (2, 2), stride: (2, 2) };
        assert_eq!(RuleKind::ZPool.bind_layer(&pool, &config).unwrap().name(), "MaxPool2d");
    }

    #[test]
    fn test_bind_function() {
        let config = PropagationConfig::default();
        assert_eq!(RuleKind::AddMerge.bind_function(&config).unwrap().name(), "Add");
        assert!(RuleKind::AlphaBeta.bind_function(&config).is_err());
        assert!(RuleKind::PassThrough.bind_function(&config).is_err());
    }

    #[test]
    fn test_single_input_arity() {
        let x = array![1.0f32].into_dyn();
        assert!(single_input("t", &[&x]).is_ok());
        assert!(matches!(single_input("t", &[&x, &x]), Err(RelpropError::ArityMismatch { .. })));
    }
}
