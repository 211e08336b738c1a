//! Rules for shape-preserving, per-element layers.
use super::{single_input, RelProp, Relevance};
use crate::error::Result;
use crate::model::BatchNorm2d;
use crate::tensor::{self, Tensor};
use ndarray::{Array1, Axis};
use smallvec::smallvec;

/// `R_in = R`. Used for inputs, the output sink, ReLU and Dropout.
pub struct PassThrough;

impl RelProp for PassThrough {
    fn name(&self) -> &'static str {
        "PassThrough"
    }

    fn relprop(&self, relevance: &Tensor, _inputs: &[&Tensor]) -> Result<Relevance> {
        Ok(smallvec![relevance.clone()])
    }
}

/// Inference-mode batch norm treated as a per-channel scaling:
/// `w = gamma / sqrt(var + eps)`, `Z = X * w + stabilizer`, `R_in = X * (R / Z) * w`.
pub struct BatchNormRule {
    scale: Array1<f32>,
    stabilizer: f32,
    norm: BatchNorm2d,
}

impl BatchNormRule {
    pub fn new(norm: &BatchNorm2d, stabilizer: f32) -> Self {
        Self { scale: norm.scale(), stabilizer, norm: norm.clone() }
    }

    fn scaled(&self, x: &Tensor) -> Tensor {
        let mut out = x.clone();
        for (ch, mut plane) in out.axis_iter_mut(Axis(1)).enumerate() {
            let w = self.scale[ch];
            plane.mapv_inplace(|v| v * w);
        }
        out
    }
}

impl RelProp for BatchNormRule {
    fn name(&self) -> &'static str {
        "BatchNorm2d"
    }

    fn relprop(&self, relevance: &Tensor, inputs: &[&Tensor]) -> Result<Relevance> {
        let x = single_input(self.name(), inputs)?;
        self.norm.check_channels(x)?;
        tensor::ensure_same_shape("relevance at batch norm output", x, relevance)?;

        let z = self.scaled(x).mapv(|v| v + self.stabilizer);
        let s = tensor::safe_divide(relevance, &z)?;
        Ok(smallvec![self.scaled(&(x * &s))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::tensor;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_pass_through_copies() {
        let r = array![0.25f32, 0.75].into_dyn();
        let out = PassThrough.relprop(&r, &[]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], r);
    }

    #[test]
    fn test_batch_norm_conserves_up_to_stabilizer() {
        let mut bn = BatchNorm2d::identity(2);
        bn.gamma = array![2.0, 0.5];
        bn.running_var = array![1.0, 4.0];
        let rule = BatchNormRule::new(&bn, 1e-9);
        let x = tensor(&[1, 2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let r = tensor(&[1, 2, 1, 2], vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let out = rule.relprop(&r, &[&x]).unwrap();
        for (a, b) in out[0].iter().zip(r.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_batch_norm_zero_input_gets_nothing() {
        let rule = BatchNormRule::new(&BatchNorm2d::identity(1), 1e-9);
        let x = tensor(&[1, 1, 1, 2], vec![0.0, 1.0]).unwrap();
        let r = tensor(&[1, 1, 1, 2], vec![5.0, 1.0]).unwrap();
        let out = rule.relprop(&r, &[&x]).unwrap();
        assert_eq!(out[0][[0, 0, 0, 0]], 0.0);
        assert_abs_diff_eq!(out[0][[0, 0, 0, 1]], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_batch_norm_checks_channels() {
        let rule = BatchNormRule::new(&BatchNorm2d::identity(3), 1e-9);
        let x = tensor(&[1, 2, 1, 1], vec![1.0, 1.0]).unwrap();
        assert!(rule.relprop(&x, &[&x]).is_err());
    }
}
