//! Rules for the stateless functions: elementwise add and flatten.
use super::{single_input, RelProp, Relevance};
use crate::config::AddSplit;
use crate::error::{RelpropError, Result};
use crate::tensor::{self, Tensor};
use smallvec::smallvec;

/// Splits relevance over the two operands of an elementwise add, slot 0 first.
pub struct AddRule {
    split: AddSplit,
}

impl AddRule {
    pub fn new(split: AddSplit) -> Self {
        Self { split }
    }
}

#[inline]
fn ratio(num: f32, den: f32) -> f32 {
    if den == 0.0 { 0.0 } else { num / den }
}

impl RelProp for AddRule {
    fn name(&self) -> &'static str {
        "Add"
    }

    fn relprop(&self, relevance: &Tensor, inputs: &[&Tensor]) -> Result<Relevance> {
        let &[xa, xb] = inputs else {
            return Err(RelpropError::ArityMismatch { name: self.name().into(), expected: 2, actual: inputs.len() });
        };
        tensor::ensure_same_shape("add operands", xa, xb)?;
        tensor::ensure_same_shape("relevance at add output", xa, relevance)?;

        match self.split {
            AddSplit::Equal => {
                let half = relevance * 0.5;
                Ok(smallvec![half.clone(), half])
            }
            AddSplit::Proportional => {
                // 1. Share by contribution to the sum.
                let z = xa + xb;
                let s = tensor::safe_divide(relevance, &z)?;
                let a = xa * &s;
                let b = xb * &s;

                // 2. Rescale so the branch totals split the incoming total by |share|.
                let (a_sum, b_sum) = (a.sum(), b.sum());
                let total = relevance.sum();
                let a_fact = ratio(a_sum.abs(), a_sum.abs() + b_sum.abs()) * total;
                let b_fact = ratio(b_sum.abs(), a_sum.abs() + b_sum.abs()) * total;
                Ok(smallvec![a * ratio(a_fact, a_sum), b * ratio(b_fact, b_sum)])
            }
        }
    }
}

/// Reshapes relevance back to the captured input's shape.
pub struct FlattenRule;

impl RelProp for FlattenRule {
    fn name(&self) -> &'static str {
        "Flatten"
    }

    fn relprop(&self, relevance: &Tensor, inputs: &[&Tensor]) -> Result<Relevance> {
        let x = single_input(self.name(), inputs)?;
        Ok(smallvec![tensor::reshape(relevance, x.shape())?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::tensor;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rstest::rstest;

    #[rstest]
    #[case(AddSplit::Equal, 0.5, 0.5)]
    #[case(AddSplit::Proportional, 0.4, 0.6)]
    fn test_add_split_scenarios(#[case] split: AddSplit, #[case] left: f32, #[case] right: f32) {
        let (xa, xb) = (array![2.0f32].into_dyn(), array![3.0f32].into_dyn());
        let out = AddRule::new(split).relprop(&array![1.0f32].into_dyn(), &[&xa, &xb]).unwrap();
        assert_eq!(out.len(), 2);
        assert_abs_diff_eq!(out[0][[0]], left, epsilon = 1e-6);
        assert_abs_diff_eq!(out[1][[0]], right, epsilon = 1e-6);
    }

    #[test]
    fn test_proportional_add_conserves_with_mixed_signs() {
        let xa = array![1.0f32, -2.0, 3.0].into_dyn();
        let xb = array![0.5f32, 4.0, -1.0].into_dyn();
        let r = array![0.2f32, 0.3, 0.5].into_dyn();
        let out = AddRule::new(AddSplit::Proportional).relprop(&r, &[&xa, &xb]).unwrap();
        assert_abs_diff_eq!(out[0].sum() + out[1].sum(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_add_requires_two_operands() {
        let x = array![1.0f32].into_dyn();
        let err = AddRule::new(AddSplit::Equal).relprop(&x, &[&x]).unwrap_err();
        assert!(matches!(err, RelpropError::ArityMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn test_flatten_restores_shape() {
        let x = tensor(&[1, 2, 2, 2], vec![1.0; 8]).unwrap();
        let r = tensor(&[1, 8], (0..8).map(|v| v as f32).collect()).unwrap();
        let out = FlattenRule.relprop(&r, &[&x]).unwrap();
        assert_eq!(out[0].shape(), &[1, 2, 2, 2]);
        assert_eq!(out[0][[0, 1, 0, 1]], 5.0);
    }
}
